//! Protocol-level tuning knobs shared by every daemon role.
//!
//! Buffer sizing and frame limits live on `distbuild_core::ConnectionOptions`
//! — this module only covers the layer above the wire: how often to ping an
//! idle peer and how many `Execute` requests an Emitter keeps in flight per
//! Absorber before it prefers a different peer.

use std::time::Duration;

/// Protocol version this build speaks. Bumped on any incompatible change to
/// `Message`'s shape; daemons reject peers advertising a different major.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct ProtocolConfig {
    /// How often an idle connection sends `Message::Ping` to detect a dead
    /// peer faster than the OS-level TCP keepalive would.
    pub ping_interval: Duration,
    /// How long to wait for a `Pong` before treating the peer as down.
    pub ping_timeout: Duration,
    /// Per-peer cap on outstanding `Execute` requests an Emitter will queue
    /// before marking that peer `PeerHealth::Suspect` and preferring
    /// another one.
    pub max_in_flight_per_peer: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            max_in_flight_per_peer: 8,
        }
    }
}

impl ProtocolConfig {
    #[must_use]
    pub fn with_ping_interval(mut self, ivl: Duration) -> Self {
        self.ping_interval = ivl;
        self
    }

    #[must_use]
    pub fn with_max_in_flight_per_peer(mut self, n: u32) -> Self {
        self.max_in_flight_per_peer = n;
        self
    }
}
