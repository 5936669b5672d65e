//! A content-addressed, size-bounded object cache for compiled translation
//! units: `FileCache` stores zstd-compressed objects keyed by a 128-bit
//! `distbuild_proto::cachekey::CacheKey`, evicting from an in-memory LRU
//! index once `max_bytes` is exceeded.

#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod layout;
pub mod lru;
pub mod store;

pub mod prelude {
    pub use crate::error::{CacheError, Result};
    pub use crate::store::{Entry, FileCache};
}
