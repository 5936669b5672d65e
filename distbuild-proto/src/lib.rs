//! Wire protocol for distbuild: compiler-invocation canonicalization, cache
//! key derivation, and the `Message` envelope daemons exchange over a
//! `distbuild_core::Connection`.
//!
//! This crate is sans-IO: nothing here touches a socket or a thread. It only
//! defines what bytes mean.

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cachekey;
pub mod canon;
pub mod config;
pub mod message;

pub mod prelude {
    pub use crate::cachekey::{CacheKey, Manifest, ManifestHeader};
    pub use crate::canon::{canonicalize, Action, Command, FlagBuckets};
    pub use crate::config::{ProtocolConfig, PROTOCOL_VERSION};
    pub use crate::message::{CodecError, Message, MetricsSnapshot, PeerEntry, PeerListing, StatusCode};
}
