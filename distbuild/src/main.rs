//! `distbuildd`: runs exactly one role (emitter, absorber, coordinator, or
//! collector) per process. Which role, and how it's configured, comes from
//! `distbuild::config`; everything else — wiring the role to the network,
//! starting its background heartbeats, handling signals — lives here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::Parser;
use distbuild::collector::{self, Collector};
use distbuild::config::{Cli, Role, Settings};
use distbuild::coordinator::{self, Coordinator};
use distbuild::daemon_role::DaemonRoleHandler;
use distbuild::emitter::Emitter;
use distbuild::error::DaemonError;
use distbuild::network_service::{self, NetworkService};
use distbuild::{absorber::Absorber, dev_tracing, signal, tempdir_sweep};
use distbuild_core::conn_options::ConnectionOptions;
use distbuild_core::event_loop::LoopCommand;
use distbuild_core::metrics::MetricsTable;
use distbuild_core::reconnect::ReconnectState;
use distbuild_proto::message::{Message, StatusCode};
use tracing::{error, info, warn};

const ACCEPT_BACKLOG: i32 = 128;

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    let cli = Cli::parse();

    if let Ok(levels) = std::env::var("DC_LOG_LEVELS") {
        // `log.levels`/`DC_LOG_LEVELS` is a comma-separated directive list in
        // the same shape `tracing-subscriber`'s `EnvFilter` already parses;
        // feed it straight through rather than inventing a second grammar.
        // SAFETY: single-threaded at this point, before any role spawns.
        unsafe { std::env::set_var("RUST_LOG", levels) };
    } else if let Ok(mark) = std::env::var("DC_LOG_ERROR_MARK") {
        // `log.error_mark` is the severity floor when no per-target
        // directives are given: a bare level name ("warn", "error") is a
        // valid `EnvFilter` directive on its own.
        // SAFETY: single-threaded at this point, before any role spawns.
        unsafe { std::env::set_var("RUST_LOG", mark) };
    }
    dev_tracing::init_tracing();

    let settings = match Settings::load(cli.config.as_ref()) {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            error!(%err, "failed to load configuration");
            return 1;
        }
    };

    let removed = tempdir_sweep::sweep(std::path::Path::new("/tmp"));
    if removed > 0 {
        info!(removed, "swept orphaned compile directories left by a previous crash");
    }

    match run_role(cli.role, settings) {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "daemon exited with an error");
            1
        }
    }
}

fn conn_options(settings: &Settings) -> ConnectionOptions {
    ConnectionOptions {
        max_frame_bytes: settings.max_frame_bytes,
        write_high_watermark_bytes: settings.write_high_watermark_bytes,
        ..Default::default()
    }
}

fn run_role(role: Role, settings: Arc<Settings>) -> Result<(), DaemonError> {
    let metrics = Arc::new(MetricsTable::new());
    let opts = conn_options(&settings);

    let (service, pushers): (NetworkService, Vec<JoinHandle<()>>) = match role {
        Role::Emitter => {
            let emitter = Emitter::new(settings.clone(), metrics.clone()).map_err(DaemonError::Cache)?;
            let cache = emitter.cache();
            let listen = Some(settings.emitter.listen);
            let service = spawn(listen, &opts, metrics.clone(), emitter)?;
            let mut pushers = background_pushers(&settings, &metrics, &service, None);
            pushers.push(spawn_cache_prune(cache, settings.cache.clean_period));
            if let Some(coordinator) = settings.emitter.coordinator {
                pushers.push(spawn_peer_poll(coordinator, settings.coordinator.poll_interval, service.command_sender(), opts.clone()));
            }
            (service, pushers)
        }
        Role::Absorber => {
            let absorber = Absorber::new(settings.clone(), metrics.clone());
            let listen = Some(settings.absorber.listen);
            let service = spawn(listen, &opts, metrics.clone(), absorber)?;
            let heartbeat = format!(
                "{}:{} threads={}",
                settings.absorber.listen.ip(),
                settings.absorber.listen.port(),
                settings.absorber.threads
            );
            let pushers = background_pushers(&settings, &metrics, &service, Some((settings.absorber.coordinator, heartbeat)));
            (service, pushers)
        }
        Role::Coordinator => {
            let coordinator = Coordinator::new(settings.clone(), metrics.clone());
            let service = spawn(Some(settings.coordinator.listen), &opts, metrics.clone(), coordinator)?;
            (service, Vec::new())
        }
        Role::Collector => {
            let collector = Collector::new(settings.clone(), metrics.clone());
            let listen = settings.metrics.listen;
            let service = spawn(listen, &opts, metrics.clone(), collector)?;
            (service, Vec::new())
        }
    };

    signal::install(vec![service.shutdown_handle()]).map_err(DaemonError::Signal)?;

    info!(?role, "distbuildd running");
    service.join();
    // The heartbeat/metrics/peer-poll threads have no stop signal of their
    // own and loop forever; `main` exits the process right after this
    // returns, which is what actually ends them. Joining here would hang.
    drop(pushers);
    Ok(())
}

fn spawn<R>(
    listen: Option<SocketAddr>,
    opts: &ConnectionOptions,
    metrics: Arc<MetricsTable>,
    role: R,
) -> Result<NetworkService, DaemonError>
where
    R: DaemonRoleHandler + Send + 'static,
{
    NetworkService::spawn(listen, ACCEPT_BACKLOG, opts.clone(), metrics, role).map_err(DaemonError::Network)
}

/// Starts the background threads every role that talks to a Coordinator or
/// Collector needs: a heartbeat (Absorber only, carrying its listen address
/// and thread count so the Coordinator's directory stays current) and a
/// metrics push (any role with `metrics.collector` configured).
fn background_pushers(
    settings: &Arc<Settings>,
    metrics: &Arc<MetricsTable>,
    service: &NetworkService,
    heartbeat: Option<(Option<SocketAddr>, String)>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let opts = conn_options(settings);

    if let Some((Some(coordinator), description)) = heartbeat {
        let interval = coordinator::heartbeat_interval(settings);
        let commands = service.command_sender();
        let mut backoff = ReconnectState::new(&opts);
        handles.push(thread::spawn(move || {
            loop {
                if push_once(
                    coordinator,
                    &commands,
                    &opts,
                    Message::Status { code: StatusCode::Registered, description: description.clone() },
                ) {
                    backoff.reset();
                    thread::sleep(interval);
                } else {
                    thread::sleep(backoff.next_delay());
                }
            }
        }));
    }

    if let Some(collector) = settings.metrics.collector {
        let interval = settings.metrics.push_interval;
        let commands = service.command_sender();
        let metrics = metrics.clone();
        let peer_id = format!("pid:{}", std::process::id());
        let opts = conn_options(settings);
        let mut backoff = ReconnectState::new(&opts);
        handles.push(thread::spawn(move || {
            loop {
                let description = collector::snapshot_description(&peer_id, &metrics);
                if push_once(collector, &commands, &opts, Message::Status { code: StatusCode::MetricsPush, description }) {
                    backoff.reset();
                    thread::sleep(interval);
                } else {
                    thread::sleep(backoff.next_delay());
                }
            }
        }));
    }

    handles
}

/// Periodically asks the Coordinator for its current peer list; the reply
/// arrives asynchronously on the same connection and is routed back to
/// `Emitter::handle_message`, which reconciles the selector.
fn spawn_peer_poll(
    coordinator: SocketAddr,
    interval: Duration,
    commands: flume::Sender<LoopCommand>,
    opts: ConnectionOptions,
) -> JoinHandle<()> {
    let mut backoff = ReconnectState::new(&opts);
    thread::spawn(move || loop {
        // Unlike `push_once`, the connection is left open: the Coordinator's
        // reply arrives asynchronously on it and is routed to
        // `Emitter::handle_message` as an ordinary frame. It accumulates as
        // one registered connection per poll tick rather than closing
        // immediately after send.
        match network_service::connect_and_register(coordinator, &commands, &opts) {
            Ok(handle) => {
                network_service::send_message(
                    &handle,
                    &Message::Status { code: StatusCode::PeerList, description: String::new() },
                );
                backoff.reset();
                thread::sleep(interval);
            }
            Err(err) => {
                warn!(%coordinator, %err, "peer list poll failed to connect");
                thread::sleep(backoff.next_delay());
            }
        }
    })
}

/// Sweeps the object cache for entries older than `clean_period` on every
/// tick of that same period. `prune`'s cost scales with cache size, not
/// request volume, so running it on a timer rather than per-request keeps
/// it off the request-handling path entirely.
fn spawn_cache_prune(cache: Arc<distbuild_cache::store::FileCache>, clean_period: Duration) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(clean_period);
        match cache.prune(clean_period) {
            Ok(pruned) if pruned > 0 => info!(pruned, "pruned stale cache entries"),
            Ok(_) => {}
            Err(err) => warn!(%err, "cache prune failed"),
        }
    })
}

/// Connects, sends one message, and closes. Returns whether the connect
/// succeeded, so callers can reset or advance a `ReconnectState` backoff.
fn push_once(addr: SocketAddr, commands: &flume::Sender<LoopCommand>, opts: &ConnectionOptions, message: Message) -> bool {
    match network_service::connect_and_register(addr, commands, opts) {
        Ok(handle) => {
            network_service::send_message(&handle, &message);
            let _ = handle.close();
            true
        }
        Err(err) => {
            warn!(%addr, %err, "periodic push failed to connect");
            false
        }
    }
}
