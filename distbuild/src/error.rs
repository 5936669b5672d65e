//! Top-level error type for `distbuildd`'s startup path. Per-request
//! failures never reach here — those are always turned into a
//! `Message::Result` with a nonzero exit code by the owning role; this type
//! only covers the things that keep the process from starting at all.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open cache: {0}")]
    Cache(#[source] std::io::Error),

    #[error("failed to start network service: {0}")]
    Network(#[source] std::io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}
