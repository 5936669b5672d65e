//! A framed, non-blocking TCP connection registered with an `EventLoop`.
//!
//! Read side: `WantHeader -> WantBody(n) -> Deliver -> WantHeader`, driven
//! by `FrameDecoder`. Write side: frames are enqueued with their length
//! prefix already attached and drained in order; only one frame is
//! partially in flight at a time, tracked by a byte offset into its front
//! element.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Registry, Token};

use crate::backpressure::{WriteBudget, WriteReservation};
use crate::buffer::SegmentedBuffer;
use crate::conn_options::ConnectionOptions;
use crate::error::{Error, Result};
use crate::framing::{encode_frame, FrameDecoder};
use crate::poison::PoisonGuard;

const READ_CHUNK: usize = 64 * 1024;

/// A single framed duplex connection.
pub struct Connection {
    stream: TcpStream,
    decoder: FrameDecoder,
    read_buf: SegmentedBuffer,
    write_queue: VecDeque<(Bytes, WriteReservation)>,
    write_offset: usize,
    write_budget: WriteBudget,
    poisoned: bool,
    last_activity: Instant,
    read_timeout: Duration,
}

impl Connection {
    #[must_use]
    pub fn new(stream: TcpStream, options: &ConnectionOptions) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(options.max_frame_bytes),
            read_buf: SegmentedBuffer::new(),
            write_queue: VecDeque::new(),
            write_offset: 0,
            write_budget: WriteBudget::new(options.write_high_watermark_bytes),
            poisoned: false,
            last_activity: Instant::now(),
            read_timeout: options.connect_timeout,
        }
    }

    pub(crate) fn source(&mut self) -> &mut Self {
        self
    }

    /// Idle time since the last byte was read or written.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    #[must_use]
    pub fn has_timed_out(&self) -> bool {
        self.idle_for() > self.read_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Enqueue `payload` for sending, framing it with its length prefix.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` if the connection was already poisoned, or
    /// `Error::Backpressure` if the write queue is already past the
    /// watermark.
    pub fn enqueue_send(&mut self, payload: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(Error::Closed);
        }
        let frame = encode_frame(payload).freeze();
        let reservation = self.write_budget.try_reserve(frame.len())?;
        self.write_queue.push_back((frame, reservation));
        Ok(())
    }

    /// Read as much as is available without blocking, returning every
    /// complete frame decoded from the accumulated bytes alongside the
    /// outcome of the read burst.
    ///
    /// Frames already decoded earlier in the same burst are always returned,
    /// even when the burst ends in an error — a peer that pipelines a valid
    /// frame immediately followed by an oversized one must not lose the
    /// valid one just because the decoder chokes on what came after it. The
    /// caller should deliver every returned frame before acting on the
    /// accompanying `Err`.
    ///
    /// The `Result` is `Err(Error::Closed)` on peer hangup (zero-byte read),
    /// or `Err(Error::Protocol)`/`Err(Error::FrameTooLarge)` from the
    /// decoder.
    pub fn pump_read(&mut self) -> (Vec<Bytes>, Result<()>) {
        let mut frames = Vec::new();
        loop {
            let mut chunk = BytesMut::zeroed(READ_CHUNK);
            match self.stream.read(&mut chunk) {
                Ok(0) => return (frames, Err(Error::peer_disconnected("read returned 0 bytes"))),
                Ok(n) => {
                    self.last_activity = Instant::now();
                    chunk.truncate(n);
                    self.read_buf.push(chunk.freeze());
                    loop {
                        match self.decoder.decode(&mut self.read_buf) {
                            Ok(Some(frame)) => frames.push(frame),
                            Ok(None) => break,
                            Err(e) => return (frames, Err(e)),
                        }
                    }
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return (frames, Err(Error::Io(e))),
            }
        }
        (frames, Ok(()))
    }

    /// Drain queued frames until the socket would block or the queue is
    /// empty. Returns `true` if the queue fully drained (caller should stop
    /// watching for writability).
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on a write failure other than `WouldBlock`.
    pub fn pump_write(&mut self) -> Result<bool> {
        while let Some((front, _reservation)) = self.write_queue.front() {
            let guard = PoisonGuard::new(&mut self.poisoned);
            let remaining = &front[self.write_offset..];
            match self.stream.write(remaining) {
                Ok(0) => return Err(Error::peer_disconnected("write returned 0 bytes")),
                Ok(n) => {
                    self.last_activity = Instant::now();
                    self.write_offset += n;
                    if self.write_offset >= front.len() {
                        self.write_queue.pop_front();
                        self.write_offset = 0;
                    }
                    guard.disarm();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.disarm();
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    guard.disarm();
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(true)
    }

    #[must_use]
    pub fn queued_write_bytes(&self) -> usize {
        self.write_budget.queued()
    }
}

// `std::net::TcpStream` doesn't implement `mio::event::Source` on its own;
// go through its raw fd so a `Connection` works whether it came from
// `Passive::accept` or a direct connect.
impl Source for Connection {
    fn register(&mut self, registry: &Registry, token: Token, interests: mio::Interest) -> io::Result<()> {
        use std::os::fd::AsRawFd;
        SourceFd(&self.stream.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: mio::Interest) -> io::Result<()> {
        use std::os::fd::AsRawFd;
        SourceFd(&self.stream.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        use std::os::fd::AsRawFd;
        SourceFd(&self.stream.as_raw_fd()).deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn send_and_receive_a_frame() {
        let (client, server) = pair();
        let options = ConnectionOptions::default();
        let mut sender = Connection::new(client, &options);
        let mut receiver = Connection::new(server, &options);

        sender.enqueue_send(b"hello distbuild").unwrap();
        sender.pump_write().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let (frames, outcome) = receiver.pump_read();
        outcome.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello distbuild");
    }

    /// A peer that pipelines a valid frame immediately followed by an
    /// oversized one must not lose the valid frame: `pump_read` should
    /// return it alongside the decode error, not swallow it.
    #[test]
    fn pump_read_returns_frames_decoded_before_a_later_decode_error() {
        let (client, server) = pair();
        let options = ConnectionOptions::default().with_max_frame_bytes(32);
        let mut sender = Connection::new(client, &ConnectionOptions::default());
        let mut receiver = Connection::new(server, &options);

        sender.enqueue_send(b"ok").unwrap();
        sender.pump_write().unwrap();
        sender.enqueue_send(&[0u8; 64]).unwrap();
        sender.pump_write().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let (frames, outcome) = receiver.pump_read();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ok");
        assert!(matches!(outcome, Err(Error::FrameTooLarge { .. })));
    }

    #[test]
    fn backpressure_rejects_over_watermark() {
        let (client, _server) = pair();
        let options = ConnectionOptions::default().with_write_high_watermark_bytes(8);
        let mut sender = Connection::new(client, &options);

        sender.enqueue_send(&[0u8; 16]).unwrap();
        let err = sender.enqueue_send(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));
    }
}
