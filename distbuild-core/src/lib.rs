//! Transport primitives shared by every distbuild daemon.
//!
//! - Move-only descriptor ownership (`handle`)
//! - Readiness-based event loop (`event_loop`)
//! - Framed, backpressured connections (`connection`, `framing`)
//! - Worker threads draining a bounded queue (`worker_pool`, `locked_queue`)
//! - Peer health and least-loaded selection (`worker_select`)
//! - Process-global counters (`metrics`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod backpressure;
pub mod buffer;
pub mod conn_options;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod framing;
pub mod handle;
pub mod locked_queue;
pub mod metrics;
pub mod poison;
pub mod reconnect;
pub mod tcp;
pub mod worker_pool;
pub mod worker_select;

pub mod prelude {
    pub use crate::buffer::SegmentedBuffer;
    pub use crate::conn_options::ConnectionOptions;
    pub use crate::connection::Connection;
    pub use crate::error::{Error, Result};
    pub use crate::event_loop::{ConnectionHandle, EventLoop, LoopHandler, ShutdownHandle};
    pub use crate::framing::{encode_frame, FrameDecoder};
    pub use crate::handle::{Handle, Passive, Pipe, Socket};
    pub use crate::locked_queue::LockedQueue;
    pub use crate::metrics::MetricsTable;
    pub use crate::worker_pool::WorkerPool;
    pub use crate::worker_select::{PeerHealth, WorkerSelector};
}
