//! Core error types.
//!
//! Comprehensive error handling for the transport layer: handles, sockets,
//! the event loop, and framed connections.

use std::io;
use thiserror::Error;

/// Main error type for distbuild-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during socket/handle operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Frame too large, truncated, or unknown kind.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Per-operation deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Connection already closed.
    #[error("connection closed")]
    Closed,

    /// Write queue deeper than `write_high_watermark`.
    #[error("backpressure: {queued} bytes queued (watermark {watermark})")]
    Backpressure { queued: usize, watermark: usize },

    /// Peer sent a frame whose declared length exceeds `max_frame`.
    #[error("frame of {size} bytes exceeds max_frame {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Channel send failed because the receiver was dropped or the queue was closed.
    #[error("channel send failed")]
    ChannelSend,

    /// Channel receive failed because the queue was closed and drained.
    #[error("channel receive failed")]
    ChannelRecv,

    /// Peer disconnected mid-operation.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),
}

/// Result type alias for distbuild-core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    #[must_use]
    pub fn peer_disconnected(peer: impl Into<String>) -> Self {
        Self::PeerDisconnected(peer.into())
    }

    /// Errors that the Emitter's remote-try strategy should retry against a
    /// different peer, as opposed to surfacing to the client.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(_) | Self::Closed | Self::PeerDisconnected(_)
        )
    }

    /// True for transient conditions a caller may retry on the *same* peer
    /// without backing off (e.g. an interrupted syscall).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
