//! Single-threaded readiness demultiplexer.
//!
//! One `EventLoop` thread owns every registered `Connection`. Handlers run
//! inline on that thread and must never block; they push bytes into a
//! `Connection`'s read buffer or mark it writable, then return. Cross-thread
//! callers — a worker finishing a compile, the Coordinator client wanting to
//! send a heartbeat — reach the loop through a `ConnectionHandle`, never by
//! touching a `Connection` directly.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use mio::unix::SourceFd;

use crate::connection::Connection;
use crate::handle::{Handle, Pipe};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// What a `Connection` wants registered with the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    ReadWrite,
}

impl Capability {
    fn to_interest(self) -> Interest {
        match self {
            Self::Read => Interest::READABLE,
            Self::Write => Interest::WRITABLE,
            Self::ReadWrite => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

/// A cross-thread reference to a registered connection: a token plus a
/// command sender. Cloneable, cheap, outlives the `EventLoop` reference it
/// came from.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub token: Token,
    pub commands: flume::Sender<LoopCommand>,
}

impl ConnectionHandle {
    /// Ask the loop thread to enqueue `frame` for sending on this
    /// connection's underlying socket.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelSend` if the loop has already shut down.
    pub fn send(&self, frame: bytes::Bytes) -> crate::error::Result<()> {
        self.commands
            .send(LoopCommand::Send(self.token, frame))
            .map_err(|_| crate::error::Error::ChannelSend)
    }

    /// Ask the loop thread to close and deregister this connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelSend` if the loop has already shut down.
    pub fn close(&self) -> crate::error::Result<()> {
        self.commands
            .send(LoopCommand::Close(self.token))
            .map_err(|_| crate::error::Error::ChannelSend)
    }
}

/// Commands the loop thread drains once per wake-up, in addition to
/// servicing readiness events.
pub enum LoopCommand {
    Register(Connection, Capability, flume::Sender<Token>),
    Send(Token, bytes::Bytes),
    Close(Token),
    Shutdown,
}

/// Cross-thread way to stop an `EventLoop::run`.
///
/// Cloneable: every Emitter/Absorber/Coordinator shutdown path (a ctrlc
/// handler, a fatal error in another thread) can hold one independently.
#[derive(Clone)]
pub struct ShutdownHandle {
    commands: flume::Sender<LoopCommand>,
    wake: Arc<Handle>,
}

impl ShutdownHandle {
    /// # Errors
    ///
    /// Returns an error if waking the self-pipe fails; the shutdown command
    /// is still enqueued and will be observed on the loop's next scheduled
    /// wake-up.
    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self.commands.send(LoopCommand::Shutdown);
        notify_pipe(&self.wake)
    }
}

fn notify_pipe(write_end: &Handle) -> io::Result<()> {
    let byte = [1u8];
    let ret = unsafe { libc::write(write_end.raw_fd(), byte.as_ptr().cast(), 1) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// What the caller of `EventLoop::run` wants to happen for a readable or
/// writable connection.
pub trait LoopHandler {
    /// Invoked when a connection delivers a complete frame.
    fn on_frame(&mut self, token: Token, frame: bytes::Bytes);
    /// Invoked when a connection transitions to `Closed` (peer hangup, I/O
    /// error, or an explicit `ConnectionHandle::close`).
    fn on_closed(&mut self, token: Token, reason: crate::error::Error);
}

/// Single-threaded readiness loop over a registration table of
/// `Connection`s.
pub struct EventLoop {
    poll: Poll,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    wake_read: Handle,
    wake_write: Arc<Handle>,
    commands_tx: flume::Sender<LoopCommand>,
    commands_rx: flume::Receiver<LoopCommand>,
    shutdown: bool,
}

impl EventLoop {
    /// # Errors
    ///
    /// Returns an error if the underlying `mio::Poll` or self-pipe cannot
    /// be created.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let Pipe { read: wake_read, write: wake_write } = Pipe::new(false)?;
        poll.registry().register(
            &mut SourceFd(&wake_read.raw_fd()),
            WAKE_TOKEN,
            Interest::READABLE,
        )?;
        let (commands_tx, commands_rx) = flume::unbounded();
        Ok(Self {
            poll,
            connections: HashMap::new(),
            next_token: 0,
            wake_read,
            wake_write: Arc::new(wake_write),
            commands_tx,
            commands_rx,
            shutdown: false,
        })
    }

    /// A sender usable from any thread to push `LoopCommand`s; paired with
    /// `wake()` it lets other threads register connections or enqueue sends
    /// without the loop thread busy-polling.
    #[must_use]
    pub fn command_sender(&self) -> flume::Sender<LoopCommand> {
        self.commands_tx.clone()
    }

    /// A cloneable, cross-thread handle for stopping `run()`.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            commands: self.commands_tx.clone(),
            wake: self.wake_write.clone(),
        }
    }

    /// Interrupt a blocked `poll` so queued `LoopCommand`s get serviced.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the self-pipe fails.
    pub fn wake(&self) -> io::Result<()> {
        notify_pipe(&self.wake_write)
    }

    /// Register a new connection, returning the token it was assigned plus
    /// a `ConnectionHandle` other threads can use to address it.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket cannot be registered with
    /// the poller.
    pub fn register(&mut self, mut conn: Connection, cap: Capability) -> io::Result<ConnectionHandle> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(conn.source(), token, cap.to_interest())?;
        self.connections.insert(token, conn);
        Ok(ConnectionHandle {
            token,
            commands: self.commands_tx.clone(),
        })
    }

    fn deregister(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(conn.source());
        }
    }

    /// Closes any connection idle longer than its configured `read_timeout`.
    /// Runs once per `poll` wakeup, so `deadline_every` doubles as the reap
    /// granularity — a connection can sit stale for up to that long past
    /// its timeout before this catches it.
    fn reap_stale(&mut self, handler: &mut dyn LoopHandler) {
        let timed_out: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.has_timed_out())
            .map(|(token, _)| *token)
            .collect();

        for token in timed_out {
            let read_timeout = self.connections.get(&token).map(Connection::read_timeout);
            handler.on_closed(token, crate::error::Error::Timeout(read_timeout.unwrap_or_default()));
            self.deregister(token);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            match cmd {
                LoopCommand::Register(conn, cap, reply) => {
                    if let Ok(handle) = self.register(conn, cap) {
                        let _ = reply.send(handle.token);
                    }
                }
                LoopCommand::Send(token, frame) => {
                    if let Some(conn) = self.connections.get_mut(&token) {
                        let _ = conn.enqueue_send(&frame);
                        if let Err(e) = self
                            .poll
                            .registry()
                            .reregister(conn.source(), token, Interest::READABLE | Interest::WRITABLE)
                        {
                            tracing::warn!(?token, error = %e, "failed to reregister for write readiness");
                        }
                    }
                }
                LoopCommand::Close(token) => self.deregister(token),
                LoopCommand::Shutdown => self.shutdown = true,
            }
        }
    }

    fn drain_wake_pipe(&self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            let ret = unsafe { libc::read(self.wake_read.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(err);
            }
            if (ret as usize) < buf.len() {
                return Ok(());
            }
        }
    }

    /// Run until `Self::shutdown()`-triggered wake, dispatching readiness
    /// events to `handler`. `deadline_every` bounds how long a single
    /// `poll` call blocks even with nothing ready, so periodic callers
    /// (Coordinator heartbeats) can still make progress and so idle
    /// connections past their read timeout get reaped promptly.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `mio::Poll::poll` call fails for
    /// a reason other than being interrupted.
    pub fn run(&mut self, deadline_every: Duration, handler: &mut dyn LoopHandler) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        while !self.shutdown {
            match self.poll.poll(&mut events, Some(deadline_every)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in &events {
                if event.token() == WAKE_TOKEN {
                    let _ = self.drain_wake_pipe();
                    continue;
                }
                self.dispatch(event.token(), event.is_readable(), event.is_writable(), handler);
            }

            self.drain_commands();
            self.reap_stale(handler);
        }

        for (_, mut conn) in self.connections.drain() {
            let _ = self.poll.registry().deregister(conn.source());
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool, handler: &mut dyn LoopHandler) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        if readable {
            let (frames, outcome) = conn.pump_read();
            for frame in frames {
                handler.on_frame(token, frame);
            }
            if let Err(e) = outcome {
                handler.on_closed(token, e);
                self.deregister(token);
                return;
            }
        }

        if writable {
            if let Some(conn) = self.connections.get_mut(&token) {
                match conn.pump_write() {
                    Ok(drained) => {
                        if drained {
                            if let Err(e) = self.poll.registry().reregister(
                                conn.source(),
                                token,
                                Interest::READABLE,
                            ) {
                                tracing::warn!(?token, error = %e, "failed to reregister after drain");
                            }
                        }
                    }
                    Err(e) => {
                        handler.on_closed(token, e);
                        self.deregister(token);
                    }
                }
            }
        }
    }

    /// Request the loop to exit on its next wake-up, from the loop thread
    /// itself. Cross-thread callers should use `shutdown_handle()` instead.
    pub fn shutdown_now(&mut self) {
        self.shutdown = true;
    }
}
