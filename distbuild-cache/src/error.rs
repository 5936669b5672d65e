use std::io;

use thiserror::Error;

/// Cache-layer failures. Always logged and never propagated to the client —
/// a cache miss and a cache failure look the same from the Emitter's
/// perspective.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("entry corrupt: {0}")]
    Corrupt(String),
    #[error("manifest decode failed: {0}")]
    ManifestDecode(#[source] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
