//! The Emitter role: accepts a client's compile request, tries the cache,
//! then a preprocess-and-dispatch-remote path, falling back to a local
//! compile when the cache misses and no remote worker can take the job (or
//! every remote attempt fails in a retryable way).
//!
//! Each remote attempt opens a fresh Connection to the chosen Absorber
//! rather than reusing one across client requests — the wire protocol has
//! no per-message correlation id, so multiplexing multiple in-flight
//! requests over one Connection would make replies ambiguous. This trades
//! a connect round-trip per remote attempt for a correlation scheme that
//! needs no change to `Message`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use distbuild_cache::store::{Entry, FileCache};
use distbuild_core::conn_options::ConnectionOptions;
use distbuild_core::event_loop::{ConnectionHandle, LoopCommand};
use distbuild_core::metrics::MetricsTable;
use distbuild_core::worker_select::{PeerHealth, WorkerSelector};
use distbuild_proto::cachekey::{direct_key, hash_bytes, manifest_key, CacheKey, Manifest, ManifestHeader};
use distbuild_proto::canon::{Action, Command};
use distbuild_proto::config::ProtocolConfig;
use distbuild_proto::message::{Message, PeerListing, StatusCode};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::config::{RemoteHost, Settings};
use crate::daemon_role::{DaemonRoleHandler, MetricId, PeerId};
use crate::network_service::send_message;

struct PendingRequest {
    client_reply: ConnectionHandle,
    command: Command,
    preprocessed: Bytes,
    headers: Vec<ManifestHeader>,
    manifest_key: CacheKey,
    current_peer: String,
    tried_peers: Vec<String>,
    attempts_left: u32,
}

pub struct Emitter {
    settings: Arc<Settings>,
    metrics: Arc<MetricsTable>,
    cache: Arc<FileCache>,
    selector: Arc<WorkerSelector<String>>,
    protocol: ProtocolConfig,
    commands: Mutex<Option<flume::Sender<LoopCommand>>>,
    pending: DashMap<PeerId, PendingRequest>,
    /// Peers last learned from a Coordinator poll, so a subsequent poll can
    /// tell which entries disappeared versus which were always static.
    polled_peers: Mutex<std::collections::HashSet<String>>,
}

impl Emitter {
    /// # Errors
    ///
    /// Returns an error if the configured cache directory can't be opened.
    pub fn new(settings: Arc<Settings>, metrics: Arc<MetricsTable>) -> io::Result<Self> {
        let cache = FileCache::open(
            settings.cache.path.clone(),
            settings.cache.size_bytes,
            settings.cache.compression_level,
        )
        .map_err(io::Error::other)?;

        let selector = WorkerSelector::new();
        for remote in &settings.emitter.remotes {
            selector.upsert(remote.id());
        }

        Ok(Self {
            settings,
            metrics,
            cache: Arc::new(cache),
            selector: Arc::new(selector),
            protocol: ProtocolConfig::default(),
            commands: Mutex::new(None),
            pending: DashMap::new(),
            polled_peers: Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// The underlying cache, so `main.rs` can drive its periodic prune
    /// sweep without the Emitter needing to run a timer itself.
    #[must_use]
    pub fn cache(&self) -> Arc<FileCache> {
        self.cache.clone()
    }

    fn compiler_version(&self) -> &str {
        self.settings.clang_version.as_deref().unwrap_or("unknown")
    }

    fn handle_client_request(&self, command: Command, reply: &ConnectionHandle) {
        if command.action != Action::Compile || self.selector.healthy_count() == 0 {
            self.respond_local(command, reply);
            return;
        }

        let Some(raw_source) = primary_input_bytes(&command) else {
            self.respond_local(command, reply);
            return;
        };

        let mkey = manifest_key(&command, self.compiler_version(), &raw_source);
        if let Ok(Some(manifest)) = self.cache.lookup_manifest(mkey) {
            match manifest.is_valid() {
                Ok(true) => {
                    if let Ok(Some(entry)) = self.cache.lookup(manifest.object_key) {
                        self.metrics.inc(MetricId::CacheHitManifest.name());
                        reply_with_entry(reply, &entry);
                        return;
                    }
                }
                _ => self.cache.delete_manifest(mkey),
            }
        }

        match self.preprocess(&command) {
            Ok((source, _stderr, 0, headers)) => {
                if self.settings.cache.direct_enabled {
                    let dkey = direct_key(&command, self.compiler_version(), &source);
                    if let Ok(Some(entry)) = self.cache.lookup(dkey) {
                        self.metrics.inc(MetricId::CacheHitDirect.name());
                        reply_with_entry(reply, &entry);
                        return;
                    }
                }
                self.dispatch_remote(command, Bytes::from(source), headers, mkey, reply);
            }
            Ok((_, stderr, code, _)) => {
                send_message(
                    reply,
                    &Message::Result {
                        object: None,
                        stderr: Bytes::from(stderr),
                        exit_code: code,
                    },
                );
            }
            Err(err) => {
                warn!(%err, "preprocess failed to launch, falling back to a local compile");
                self.respond_local(command, reply);
            }
        }
    }

    fn dispatch_remote(
        &self,
        command: Command,
        preprocessed: Bytes,
        headers: Vec<ManifestHeader>,
        manifest_key: CacheKey,
        client_reply: &ConnectionHandle,
    ) {
        let Some(peer) = self.selector.select_below(self.protocol.max_in_flight_per_peer) else {
            self.respond_local(command, client_reply);
            return;
        };

        let Some(token_peer) = self.open_to(&peer, &command, &preprocessed) else {
            self.selector.set_health(&peer, PeerHealth::Suspect);
            self.respond_local(command, client_reply);
            return;
        };

        self.selector.mark_dispatched(&peer);
        self.pending.insert(
            token_peer,
            PendingRequest {
                client_reply: client_reply.clone(),
                command,
                preprocessed,
                headers,
                manifest_key,
                current_peer: peer.clone(),
                tried_peers: vec![peer],
                attempts_left: self.settings.max_remote_attempts.saturating_sub(1),
            },
        );
    }

    /// Dials `peer`, sends the remote-dispatch `Execute`, and returns the
    /// `PeerId` (the logical outbound-connection key) the reply will
    /// surface under, so the pending-request table can be keyed by it.
    fn open_to(&self, peer: &str, command: &Command, preprocessed: &Bytes) -> Option<PeerId> {
        let commands = self.commands.lock().clone()?;
        let addr: std::net::SocketAddr = peer.parse().ok()?;
        let handle = crate::network_service::connect_and_register(addr, &commands, &ConnectionOptions {
            max_frame_bytes: self.settings.max_frame_bytes,
            write_high_watermark_bytes: self.settings.write_high_watermark_bytes,
            ..Default::default()
        })
        .ok()?;

        let remote_command = Command {
            args: remote_dispatch_args(command),
            ..command.clone()
        };
        send_message(
            &handle,
            &Message::Execute {
                command: remote_command,
                source: preprocessed.clone(),
                deps: None,
            },
        );
        Some(format!("token:{}", handle.token.0))
    }

    fn handle_remote_reply(&self, peer: PeerId, message: Message) {
        let Some((_, pending)) = self.pending.remove(&peer) else {
            return;
        };
        self.selector.mark_finished(&pending.current_peer);

        match message {
            Message::Result { object, stderr, exit_code } => {
                self.metrics.inc(MetricId::RemoteOk.name());
                if let Some(object) = &object {
                    self.store_result(&pending, object, &stderr);
                }
                send_message(&pending.client_reply, &Message::Result { object, stderr, exit_code });
            }
            Message::Overloaded => {
                self.metrics.inc(MetricId::RemoteOverloaded.name());
                self.retry_or_fall_back(pending);
            }
            Message::Shutting => {
                self.retry_or_fall_back(pending);
            }
            _ => self.retry_or_fall_back(pending),
        }
    }

    fn retry_or_fall_back(&self, mut pending: PendingRequest) {
        if pending.attempts_left == 0 {
            self.respond_local(pending.command, &pending.client_reply);
            return;
        }

        let Some(peer) = self.select_unused_peer(&pending.tried_peers) else {
            self.metrics.inc(MetricId::RemoteFailed.name());
            self.respond_local(pending.command, &pending.client_reply);
            return;
        };

        let Some(token_peer) = self.open_to(&peer, &pending.command, &pending.preprocessed) else {
            self.selector.set_health(&peer, PeerHealth::Suspect);
            self.respond_local(pending.command, &pending.client_reply);
            return;
        };

        self.selector.mark_dispatched(&peer);
        pending.attempts_left -= 1;
        pending.current_peer = peer.clone();
        pending.tried_peers.push(peer);
        self.pending.insert(token_peer, pending);
    }

    /// Reconciles the selector against a fresh `PeerListing` polled from the
    /// Coordinator: new peers start `Healthy`, peers no longer listed are
    /// dropped. Peers carried over keep their current health and
    /// outstanding-job count rather than resetting on every poll.
    fn sync_remote_peers(&self, description: &str) {
        let Ok(listing) = serde_json::from_str::<PeerListing>(description) else {
            warn!("dropping malformed peer list from coordinator");
            return;
        };
        let statically_configured: std::collections::HashSet<String> =
            self.settings.emitter.remotes.iter().map(RemoteHost::id).collect();
        let polled: std::collections::HashSet<String> =
            listing.peers.iter().map(|p| format!("{}:{}", p.host, p.port)).collect();

        for id in &polled {
            self.selector.upsert(id.clone());
        }
        for id in self.polled_peers.lock().difference(&polled) {
            if !statically_configured.contains(id) {
                self.selector.remove(id);
            }
        }
        *self.polled_peers.lock() = polled;
    }

    fn select_unused_peer(&self, tried: &[String]) -> Option<String> {
        for _ in 0..4 {
            let candidate = self.selector.select_below(self.protocol.max_in_flight_per_peer)?;
            if !tried.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn store_result(&self, pending: &PendingRequest, object: &Bytes, stderr: &Bytes) {
        let dkey = direct_key(&pending.command, self.compiler_version(), &pending.preprocessed);
        let entry = Entry {
            object: object.to_vec(),
            stderr: stderr.to_vec(),
            deps: Vec::new(),
        };
        if let Err(err) = self.cache.store(dkey, &entry) {
            self.metrics.inc(MetricId::CacheStoreError.name());
            warn!(%err, "failed to store compile result in cache");
            return;
        }
        let manifest = Manifest {
            headers: pending.headers.clone(),
            object_key: dkey,
            extra_files: vec![],
        };
        if let Err(err) = self.cache.store_manifest(pending.manifest_key, &manifest) {
            self.metrics.inc(MetricId::CacheStoreError.name());
            warn!(%err, "failed to store manifest in cache");
        }
    }

    fn respond_local(&self, command: Command, reply: &ConnectionHandle) {
        match run_local(&self.settings, &command) {
            Ok((object, stderr, exit_code)) => {
                self.metrics.inc(MetricId::LocalCompiles.name());
                send_message(
                    reply,
                    &Message::Result {
                        object: Some(Bytes::from(object)),
                        stderr: Bytes::from(stderr),
                        exit_code,
                    },
                );
            }
            Err(err) => {
                error!(%err, "local compile failed to launch");
                send_message(
                    reply,
                    &Message::Result {
                        object: None,
                        stderr: Bytes::from(err.to_string().into_bytes()),
                        exit_code: -1,
                    },
                );
            }
        }
    }

    /// Runs the driver with `-E` (plus `-MD`/`-MF` to recover the header
    /// set), returning the preprocessed bytes, stderr, exit code, and the
    /// hashed manifest header list.
    fn preprocess(&self, command: &Command) -> io::Result<(Vec<u8>, Vec<u8>, i32, Vec<ManifestHeader>)> {
        let depdir = tempfile::Builder::new()
            .prefix(&format!("clangd-{}-", std::process::id()))
            .tempdir()?;
        let dep_path = depdir.path().join("deps.d");

        let mut args = strip_output_flag(&command.args);
        args.push("-E".to_string());
        args.push("-MD".to_string());
        args.push("-MF".to_string());
        args.push(dep_path.to_string_lossy().into_owned());

        let output = std::process::Command::new(&self.settings.clang_path)
            .args(&args)
            .current_dir(&command.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        let headers = std::fs::read(&dep_path)
            .ok()
            .map(|bytes| hash_headers(&command.cwd, &bytes))
            .unwrap_or_default();

        Ok((output.stdout, output.stderr, output.status.code().unwrap_or(-1), headers))
    }
}

impl DaemonRoleHandler for Emitter {
    fn attach_network(&mut self, commands: flume::Sender<LoopCommand>) {
        *self.commands.lock() = Some(commands);
    }

    fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn connection_closed(&mut self, peer: PeerId) {
        if let Some((_, pending)) = self.pending.remove(&peer) {
            self.metrics.inc(MetricId::Timeouts.name());
            self.selector.mark_finished(&pending.current_peer);
            self.retry_or_fall_back(pending);
        }
    }

    fn handle_message(&mut self, peer: PeerId, message: Message, reply: &ConnectionHandle) {
        match message {
            Message::Execute { command, .. } => self.handle_client_request(command, reply),
            Message::Result { .. } | Message::Overloaded | Message::Shutting => {
                self.handle_remote_reply(peer, message);
            }
            Message::Status { code: StatusCode::PeerList, description } => {
                self.sync_remote_peers(&description);
            }
            Message::Ping => send_message(reply, &Message::Pong),
            _ => {}
        }
    }
}

fn reply_with_entry(reply: &ConnectionHandle, entry: &Entry) {
    send_message(
        reply,
        &Message::Result {
            object: Some(Bytes::from(entry.object.clone())),
            stderr: Bytes::from(entry.stderr.clone()),
            exit_code: 0,
        },
    );
}

fn primary_input_bytes(command: &Command) -> Option<Vec<u8>> {
    let input = command.inputs.first()?;
    std::fs::read(Path::new(&command.cwd).join(input)).ok()
}

/// Drops any `-o <path>` pair from `args` — the preprocess invocation wants
/// stdout, not the object file path the original compile would have used.
fn strip_output_flag(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            iter.next();
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Rewrites a local `Command`'s args for remote execution: the Absorber
/// reads its translation unit from stdin rather than the client's original
/// file layout, so any remaining input paths become `-`.
fn remote_dispatch_args(command: &Command) -> Vec<String> {
    let mut args = strip_output_flag(&command.args);
    args.retain(|a| !command.inputs.iter().any(|i| i == a));
    args.push("-x".to_string());
    args.push(command.language.clone().unwrap_or_else(|| "c++".to_string()));
    args.push("-".to_string());
    args.push("-o".to_string());
    args.push(command.output.clone().unwrap_or_else(|| "a.o".to_string()));
    args
}

/// Parses a Make-style `.d` dependency file into hashed `ManifestHeader`s,
/// resolving relative entries against `cwd`.
fn hash_headers(cwd: &str, depfile: &[u8]) -> Vec<ManifestHeader> {
    let text = String::from_utf8_lossy(depfile).replace("\\\n", " ");
    let mut headers = Vec::new();
    for (i, token) in text.split_whitespace().enumerate() {
        if i == 0 && token.ends_with(':') {
            continue;
        }
        let path = PathBuf::from(cwd).join(token);
        if let Ok(contents) = std::fs::read(&path) {
            headers.push(ManifestHeader {
                path: path.to_string_lossy().into_owned(),
                hash: hash_bytes(&contents),
            });
        }
    }
    headers
}

fn run_local(settings: &Settings, command: &Command) -> io::Result<(Vec<u8>, Vec<u8>, i32)> {
    let output = std::process::Command::new(&settings.clang_path)
        .args(&command.args)
        .current_dir(&command.cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    let object_path = command
        .output
        .as_ref()
        .map(|name| Path::new(&command.cwd).join(name));
    let object = object_path
        .and_then(|path| std::fs::read(path).ok())
        .unwrap_or_default();

    Ok((object, output.stderr, output.status.code().unwrap_or(-1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_output_flag_drops_the_pair() {
        let args = vec!["-c".to_string(), "-o".to_string(), "a.o".to_string(), "a.cc".to_string()];
        assert_eq!(strip_output_flag(&args), vec!["-c".to_string(), "a.cc".to_string()]);
    }

    #[test]
    fn hash_headers_parses_simple_depfile() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("a.h");
        std::fs::write(&header, b"contents").unwrap();
        let depfile = format!("a.o: a.cc {}\n", header.display());

        let headers = hash_headers(dir.path().to_str().unwrap(), depfile.as_bytes());
        assert!(headers.iter().any(|h| h.path.ends_with("a.h")));
    }
}
