//! Tunables shared by `Connection`, `EventLoop`, and the reconnect backoff helper.
//!
//! These mirror the `[emitter]`/`[absorber]` config knobs (`max_frame_bytes`,
//! `write_high_watermark_bytes`, `connect_timeout_sec`) but live here, not in
//! `distbuild`'s `Settings`, so this crate can be used without pulling in the
//! daemon's config layer.

use std::time::Duration;

/// Connection-level tunables.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Largest frame this side will accept before closing the connection.
    pub max_frame_bytes: usize,
    /// Queued write bytes above which `Connection::send` returns
    /// `Error::Backpressure` instead of enqueuing.
    pub write_high_watermark_bytes: usize,
    /// Timeout for the initial TCP/Unix connect.
    pub connect_timeout: Duration,
    /// Base reconnect interval.
    pub reconnect_ivl: Duration,
    /// Reconnect interval ceiling.
    pub reconnect_ivl_max: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024 * 1024,
            write_high_watermark_bytes: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            reconnect_ivl: Duration::from_millis(200),
            reconnect_ivl_max: Duration::from_secs(10),
        }
    }
}

impl ConnectionOptions {
    #[must_use]
    pub const fn with_max_frame_bytes(mut self, n: usize) -> Self {
        self.max_frame_bytes = n;
        self
    }

    #[must_use]
    pub const fn with_write_high_watermark_bytes(mut self, n: usize) -> Self {
        self.write_high_watermark_bytes = n;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    #[must_use]
    pub const fn with_reconnect_ivl(mut self, d: Duration) -> Self {
        self.reconnect_ivl = d;
        self
    }

    #[must_use]
    pub const fn with_reconnect_ivl_max(mut self, d: Duration) -> Self {
        self.reconnect_ivl_max = d;
        self
    }
}
