//! Wires a `DaemonRoleHandler` to a `distbuild_core::EventLoop`.
//!
//! Every role composes one of these rather than inheriting from a shared
//! base class: a listening `Passive` socket is optional (the Emitter binds
//! nothing unless it itself accepts callback connections), a background
//! thread accepts and feeds new connections to the loop, and the loop
//! thread itself runs `EventLoop::run` with an adapter `LoopHandler` that
//! decodes frames into `Message`s before calling into the role.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use distbuild_core::conn_options::ConnectionOptions;
use distbuild_core::connection::Connection;
use distbuild_core::error::Error as CoreError;
use distbuild_core::event_loop::{Capability, ConnectionHandle, EventLoop, LoopHandler, ShutdownHandle};
use distbuild_core::handle::{Passive, Socket};
use distbuild_core::metrics::MetricsTable;
use distbuild_proto::message::Message;
use mio::Token;
use tracing::{debug, error, warn};

use crate::daemon_role::{DaemonRoleHandler, MetricId, PeerId};

const POLL_DEADLINE: Duration = Duration::from_millis(500);

/// Runs the event loop and (optionally) an accept loop on background
/// threads, and owns the handles needed to reach either from the rest of
/// the process.
pub struct NetworkService {
    shutdown: ShutdownHandle,
    commands: flume::Sender<distbuild_core::event_loop::LoopCommand>,
    loop_thread: Option<JoinHandle<()>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl NetworkService {
    /// Spawns the event loop thread driving `role`, and, if `listen` is
    /// given, an accept thread feeding it new inbound connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the `EventLoop` or the listening socket cannot
    /// be created.
    pub fn spawn<R>(
        listen: Option<SocketAddr>,
        backlog: i32,
        conn_options: ConnectionOptions,
        metrics: Arc<MetricsTable>,
        role: R,
    ) -> io::Result<Self>
    where
        R: DaemonRoleHandler + Send + 'static,
    {
        let mut event_loop = EventLoop::new()?;
        let shutdown = event_loop.shutdown_handle();
        let commands = event_loop.command_sender();

        let accept_thread = match listen {
            Some(addr) => {
                let passive = Passive::bind_tcp(addr, backlog);
                if !passive.is_valid() {
                    return Err(io::Error::other(
                        passive.creation_error().unwrap_or("bind failed").to_string(),
                    ));
                }
                debug!(%addr, "listening");
                let accept_commands = commands.clone();
                let accept_opts = conn_options.clone();
                Some(thread::spawn(move || accept_loop(passive, accept_commands, accept_opts)))
            }
            None => None,
        };

        let mut role = role;
        role.attach_network(commands.clone());

        let mut adapter = RoleAdapter {
            role,
            metrics,
            commands: commands.clone(),
            peer_by_token: HashMap::new(),
            max_frame_bytes: conn_options.max_frame_bytes,
        };
        if let Err(err) = adapter.role.initialize() {
            return Err(io::Error::other(err.to_string()));
        }

        let loop_thread = thread::Builder::new()
            .name("distbuild-eventloop".into())
            .spawn(move || {
                if let Err(err) = event_loop.run(POLL_DEADLINE, &mut adapter) {
                    error!(%err, "event loop exited with an error");
                }
            })?;

        Ok(Self {
            shutdown,
            commands,
            loop_thread: Some(loop_thread),
            accept_thread,
        })
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn command_sender(&self) -> flume::Sender<distbuild_core::event_loop::LoopCommand> {
        self.commands.clone()
    }

    /// Signals shutdown and blocks until both background threads exit.
    pub fn join(mut self) {
        let _ = self.shutdown.shutdown();
        if let Some(handle) = self.loop_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    passive: Passive,
    commands: flume::Sender<distbuild_core::event_loop::LoopCommand>,
    conn_options: ConnectionOptions,
) {
    loop {
        match passive.accept() {
            Ok((socket, addr)) => {
                if let Err(err) = socket.set_nonblocking(true) {
                    warn!(%err, "failed to set accepted socket nonblocking, dropping connection");
                    continue;
                }
                if let Err(err) = socket.set_keep_alive(true) {
                    warn!(%err, "failed to enable TCP keepalive on accepted connection");
                }
                let stream = socket.into_tcp_stream();
                if let Err(err) = distbuild_core::tcp::enable_tcp_nodelay(&stream) {
                    warn!(%err, "failed to disable Nagle's algorithm on accepted connection");
                }
                let conn = Connection::new(stream, &conn_options);
                let (reply_tx, reply_rx) = flume::bounded(1);
                if commands
                    .send(distbuild_core::event_loop::LoopCommand::Register(conn, Capability::ReadWrite, reply_tx))
                    .is_err()
                {
                    return;
                }
                match reply_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(token) => debug!(%addr, ?token, "accepted connection"),
                    Err(_) => warn!(%addr, "event loop did not acknowledge new connection"),
                }
            }
            Err(err) => {
                error!(%err, "accept failed, stopping accept loop");
                return;
            }
        }
    }
}

/// Connects to `addr` and registers the resulting connection with the loop
/// behind `commands`, returning a `ConnectionHandle` once registration is
/// acknowledged.
///
/// # Errors
///
/// Returns an error if the TCP connect fails or the loop doesn't
/// acknowledge registration within one second.
pub fn connect_and_register(
    addr: SocketAddr,
    commands: &flume::Sender<distbuild_core::event_loop::LoopCommand>,
    conn_options: &ConnectionOptions,
) -> io::Result<ConnectionHandle> {
    let socket = Socket::connect_tcp(addr)?;
    socket.set_nonblocking(true)?;
    socket.set_keep_alive(true)?;
    let stream = socket.into_tcp_stream();
    distbuild_core::tcp::enable_tcp_nodelay(&stream)?;
    let conn = Connection::new(stream, conn_options);
    let (reply_tx, reply_rx) = flume::bounded(1);
    commands
        .send(distbuild_core::event_loop::LoopCommand::Register(conn, Capability::ReadWrite, reply_tx))
        .map_err(|_| io::Error::other("event loop is no longer running"))?;
    let token = reply_rx
        .recv_timeout(Duration::from_secs(1))
        .map_err(|_| io::Error::other("event loop did not acknowledge registration"))?;
    Ok(ConnectionHandle {
        token,
        commands: commands.clone(),
    })
}

/// Sends `message` on `handle`, logging rather than propagating a failure —
/// by the time a role wants to reply, the request that prompted it has
/// already been accounted for either way.
pub fn send_message(handle: &ConnectionHandle, message: &Message) {
    match message.encode() {
        Ok(bytes) => {
            if let Err(err) = handle.send(bytes) {
                warn!(%err, token = ?handle.token, "failed to enqueue outbound message");
            }
        }
        Err(err) => error!(%err, "failed to encode outbound message"),
    }
}

struct RoleAdapter<R> {
    role: R,
    metrics: Arc<MetricsTable>,
    commands: flume::Sender<distbuild_core::event_loop::LoopCommand>,
    peer_by_token: HashMap<Token, PeerId>,
    max_frame_bytes: usize,
}

impl<R: DaemonRoleHandler> LoopHandler for RoleAdapter<R> {
    fn on_frame(&mut self, token: Token, frame: Bytes) {
        if frame.len() > self.max_frame_bytes {
            self.metrics.inc(MetricId::ProtocolErrors.name());
            return;
        }
        let reply = ConnectionHandle {
            token,
            commands: self.commands.clone(),
        };
        match Message::decode(&frame) {
            Ok(message) => {
                let peer = self
                    .peer_by_token
                    .entry(token)
                    .or_insert_with(|| format!("token:{}", token.0))
                    .clone();
                self.role.handle_message(peer, message, &reply);
            }
            Err(err) => {
                warn!(%err, ?token, "dropping connection after undecodable frame");
                self.metrics.inc(MetricId::ProtocolErrors.name());
            }
        }
    }

    fn on_closed(&mut self, token: Token, reason: CoreError) {
        debug!(?token, %reason, "connection closed");
        if let Some(peer) = self.peer_by_token.remove(&token) {
            self.role.connection_closed(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingRole {
        received: Arc<Mutex<Vec<Message>>>,
    }

    impl DaemonRoleHandler for RecordingRole {
        fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        fn handle_message(&mut self, _peer: PeerId, message: Message, _reply: &ConnectionHandle) {
            self.received.lock().unwrap().push(message);
        }
    }

    #[test]
    fn ping_sent_to_listener_is_delivered_to_role() {
        let port = portpicker::pick_unused_port().expect("free port");
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let service = NetworkService::spawn(
            Some(addr),
            16,
            ConnectionOptions::default(),
            Arc::new(MetricsTable::new()),
            RecordingRole {
                received: received.clone(),
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        let commands = service.command_sender();
        let handle = connect_and_register(addr, &commands, &ConnectionOptions::default()).unwrap();
        send_message(&handle, &Message::Ping);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while received.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(received.lock().unwrap().len(), 1);
        service.join();
    }
}
