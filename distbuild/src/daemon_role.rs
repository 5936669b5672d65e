//! The capability set every role implements, replacing the reference
//! runtime's `BaseDaemon` inheritance hierarchy with a small trait plus
//! composition: each role owns a `NetworkService` rather than extending one.

use std::sync::Arc;

use distbuild_core::event_loop::ConnectionHandle;
use distbuild_proto::message::Message;

use crate::config::Settings;

/// Closed set of counters the daemon emits. Backs `distbuild_core`'s
/// `MetricsTable`, keyed by `MetricId::name()` rather than a free-form
/// string, so every increment site names a counter that actually exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MetricId {
    RemoteOk,
    RemoteOverloaded,
    RemoteFailed,
    CacheHitDirect,
    CacheHitManifest,
    CacheMiss,
    CacheStoreError,
    LocalCompiles,
    ProtocolErrors,
    Timeouts,
}

impl MetricId {
    pub const ALL: [Self; 10] = [
        Self::RemoteOk,
        Self::RemoteOverloaded,
        Self::RemoteFailed,
        Self::CacheHitDirect,
        Self::CacheHitManifest,
        Self::CacheMiss,
        Self::CacheStoreError,
        Self::LocalCompiles,
        Self::ProtocolErrors,
        Self::Timeouts,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RemoteOk => "remote_ok",
            Self::RemoteOverloaded => "remote_overloaded",
            Self::RemoteFailed => "remote_failed",
            Self::CacheHitDirect => "cache_hit_direct",
            Self::CacheHitManifest => "cache_hit_manifest",
            Self::CacheMiss => "cache_miss",
            Self::CacheStoreError => "cache_store_error",
            Self::LocalCompiles => "local_compiles",
            Self::ProtocolErrors => "protocol_errors",
            Self::Timeouts => "timeouts",
        }
    }
}

/// The capability set a role implementation provides. `NetworkService`
/// drives `handle_message` for every frame a registered connection
/// delivers; `update_configuration` supports a future config-reload signal
/// without restarting the process.
pub trait DaemonRoleHandler {
    /// Hands the role a sender it can use to dial out and register
    /// connections of its own (the Emitter reaching an Absorber, either role
    /// reaching a Coordinator or Collector). Called once, before
    /// `initialize`. Roles with nothing to dial leave the default no-op.
    fn attach_network(&mut self, _commands: flume::Sender<distbuild_core::event_loop::LoopCommand>) {}

    /// Called once after the role's `NetworkService` is up, before the
    /// event loop starts dispatching. Failure here is fatal at startup.
    ///
    /// # Errors
    ///
    /// Returns a boxed error describing why the role couldn't initialize
    /// (e.g. the cache directory couldn't be created).
    fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Notifies the role that the connection behind `peer` closed, so a
    /// role tracking in-flight requests against that peer (the Emitter's
    /// remote-dispatch retries) can react the same way it would to an
    /// explicit `Overloaded`/error reply. Default is a no-op for roles with
    /// no per-connection state of their own.
    fn connection_closed(&mut self, _peer: PeerId) {}

    /// Dispatches one decoded `Message` received on `peer`. `reply` is the
    /// connection it arrived on, good for the lifetime of this call — a
    /// role that needs to answer later (e.g. after a compile finishes on a
    /// worker thread) must record `peer` and look the connection back up
    /// through whatever directory it keeps, since `reply` itself isn't kept
    /// alive past this call returning.
    fn handle_message(&mut self, peer: PeerId, message: Message, reply: &ConnectionHandle);

    /// Re-applies a new `Settings` snapshot without a restart. The default
    /// implementation rejects reload, matching roles that have no mutable
    /// configuration worth hot-swapping.
    fn update_configuration(&mut self, _settings: Arc<Settings>) -> bool {
        false
    }
}

/// Identifies which connection a message arrived on or should be sent to,
/// independent of the `mio::Token` the event loop assigns — roles address
/// peers by this logical id (a `host:port` string) and the `NetworkService`
/// maps it to the live `ConnectionHandle`.
pub type PeerId = String;
