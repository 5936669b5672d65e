//! # distbuild
//!
//! A distributed C/C++ compilation daemon: local cache, remote offload, a
//! coordinator directory service, and a metrics collector, all built on
//! `distbuild-core`'s framed, non-blocking transport.
//!
//! ## Architecture
//!
//! - **`distbuild-core`**: transport primitives — `Handle`/`Socket`,
//!   `EventLoop`, `Connection`, `WorkerPool`, `LockedQueue`.
//! - **`distbuild-proto`**: wire messages, command canonicalization, cache
//!   key derivation — pure, sans-IO.
//! - **`distbuild-cache`**: the on-disk content-addressed object cache.
//! - **`distbuild`** (this crate): the four daemon roles plus the process
//!   entry point (`distbuildd`).
//!
//! ## Roles
//!
//! Every role implements [`daemon_role::DaemonRoleHandler`] and is driven by
//! a [`network_service::NetworkService`] composed around it rather than
//! inherited from — see `daemon_role` for why.
//!
//! - **Emitter**: accepts client compile requests; cache, then remote
//!   dispatch, then local compile.
//! - **Absorber**: runs compiles a peer Emitter offloaded to it.
//! - **Coordinator**: tracks which Absorbers are alive.
//! - **Collector**: aggregates metrics pushed by the other three.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod absorber;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod daemon_role;
pub mod emitter;
pub mod error;
pub mod network_service;
pub mod signal;
pub mod tempdir_sweep;

/// Development helpers (benches/tests)
pub mod dev_tracing;

/// Commonly used types, re-exported for `distbuildd`'s `main.rs` and
/// integration tests.
pub mod prelude {
    pub use crate::absorber::Absorber;
    pub use crate::collector::Collector;
    pub use crate::config::{Cli, ConfigError, Role, Settings};
    pub use crate::coordinator::Coordinator;
    pub use crate::daemon_role::{DaemonRoleHandler, MetricId, PeerId};
    pub use crate::emitter::Emitter;
    pub use crate::error::DaemonError;
    pub use crate::network_service::NetworkService;
}
