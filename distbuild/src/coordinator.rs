//! The Coordinator role: a minimal directory service. Absorbers heartbeat
//! their listen address and thread count; Emitters configured with
//! `emitter.coordinator` periodically ask for the current peer list instead
//! of carrying a static `emitter.remotes[]`.
//!
//! Grounded in the same peer-table pattern `WorkerSelector` uses for load
//! tracking (`distbuild_core::worker_select`), but keyed by wall-clock
//! freshness rather than outstanding job count: staleness, not load, is
//! this table's only concern.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use distbuild_core::event_loop::ConnectionHandle;
use distbuild_core::metrics::MetricsTable;
use distbuild_proto::message::{Message, PeerEntry, PeerListing, StatusCode};
use tracing::debug;

use crate::config::Settings;
use crate::daemon_role::{DaemonRoleHandler, PeerId};
use crate::network_service::send_message;

struct Registration {
    last_seen: Instant,
    threads: u32,
}

pub struct Coordinator {
    settings: Arc<Settings>,
    metrics: Arc<MetricsTable>,
    table: DashMap<String, Registration>,
}

impl Coordinator {
    #[must_use]
    pub fn new(settings: Arc<Settings>, metrics: Arc<MetricsTable>) -> Self {
        Self {
            settings,
            metrics,
            table: DashMap::new(),
        }
    }

    fn evict_stale(&self) {
        let stale_after = self.settings.coordinator.stale_after;
        self.table.retain(|_, reg| reg.last_seen.elapsed() < stale_after);
    }

    fn listing(&self) -> PeerListing {
        self.evict_stale();
        let peers = self
            .table
            .iter()
            .filter_map(|entry| parse_host_port(entry.key()).map(|(host, port)| PeerEntry {
                host,
                port,
                threads: entry.value().threads,
            }))
            .collect();
        PeerListing { peers }
    }
}

fn parse_host_port(id: &str) -> Option<(String, u16)> {
    let (host, port) = id.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// Parses `"<host>:<port> threads=<n>"`, the heartbeat description an
/// Absorber sends.
fn parse_registration(description: &str) -> Option<(String, u32)> {
    let mut parts = description.split_whitespace();
    let addr = parts.next()?.to_string();
    let threads = parts
        .next()
        .and_then(|s| s.strip_prefix("threads="))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    Some((addr, threads))
}

impl DaemonRoleHandler for Coordinator {
    fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn handle_message(&mut self, peer: PeerId, message: Message, reply: &ConnectionHandle) {
        match message {
            Message::Status { code: StatusCode::Registered, description } => {
                if let Some((addr, threads)) = parse_registration(&description) {
                    debug!(%addr, threads, "absorber heartbeat");
                    self.table.insert(
                        addr,
                        Registration {
                            last_seen: Instant::now(),
                            threads,
                        },
                    );
                } else {
                    debug!(%peer, %description, "malformed heartbeat, ignoring");
                }
            }
            Message::Status { code: StatusCode::PeerList, .. } => {
                let listing = self.listing();
                let description = serde_json::to_string(&listing).unwrap_or_default();
                send_message(
                    reply,
                    &Message::Status {
                        code: StatusCode::PeerList,
                        description,
                    },
                );
            }
            Message::Ping => send_message(reply, &Message::Pong),
            _ => {}
        }
    }
}

/// How often an Absorber should resend its heartbeat so the Coordinator
/// never treats it as stale mid-session: a third of `stale_after`, so at
/// least two heartbeats can be missed before eviction.
#[must_use]
pub fn heartbeat_interval(settings: &Settings) -> Duration {
    settings.coordinator.stale_after / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registration_description() {
        assert_eq!(
            parse_registration("10.0.0.5:8980 threads=8"),
            Some(("10.0.0.5:8980".to_string(), 8))
        );
    }

    #[test]
    fn parse_host_port_splits_on_last_colon() {
        assert_eq!(parse_host_port("10.0.0.5:8980"), Some(("10.0.0.5".to_string(), 8980)));
        assert_eq!(parse_host_port("not-an-addr"), None);
    }

    #[test]
    fn stale_absorber_is_dropped_from_next_listing() {
        let mut settings = Settings::load(None).unwrap();
        settings.coordinator.stale_after = Duration::from_millis(10);
        let coordinator = Coordinator::new(Arc::new(settings), Arc::new(MetricsTable::new()));

        coordinator.table.insert(
            "10.0.0.5:8980".to_string(),
            Registration {
                last_seen: Instant::now() - Duration::from_millis(50),
                threads: 4,
            },
        );

        assert!(coordinator.listing().peers.is_empty());
    }

    #[test]
    fn fresh_absorber_survives_listing() {
        let settings = Settings::load(None).unwrap();
        let coordinator = Coordinator::new(Arc::new(settings), Arc::new(MetricsTable::new()));

        coordinator.table.insert(
            "10.0.0.5:8980".to_string(),
            Registration {
                last_seen: Instant::now(),
                threads: 4,
            },
        );

        let peers = coordinator.listing().peers;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 8980);
    }
}
