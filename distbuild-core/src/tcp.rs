//! Protocol-agnostic TCP tuning shared by every `Connection`.

use std::io;
use std::net::TcpStream;

/// Disable Nagle's algorithm.
///
/// Control-plane traffic (Emitter-Coordinator heartbeats, job dispatch) is
/// latency sensitive and rarely saturates a link, so the bandwidth tradeoff
/// is the right one everywhere distbuild opens a TCP connection.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
