//! The Collector role: a metrics aggregation endpoint. Every Emitter and
//! Absorber configured with `metrics.collector` periodically pushes a
//! `MetricsSnapshot`; the Collector merges these by peer identity and
//! answers a `Dump`-style query the same way its own table would.

use std::sync::Arc;

use dashmap::DashMap;
use distbuild_core::event_loop::ConnectionHandle;
use distbuild_core::metrics::MetricsTable;
use distbuild_proto::message::{Message, MetricsSnapshot, StatusCode};
use tracing::debug;

use crate::config::Settings;
use crate::daemon_role::{DaemonRoleHandler, PeerId};
use crate::network_service::send_message;

pub struct Collector {
    settings: Arc<Settings>,
    local: Arc<MetricsTable>,
    by_peer: DashMap<String, std::collections::BTreeMap<String, u64>>,
}

impl Collector {
    #[must_use]
    pub fn new(settings: Arc<Settings>, local: Arc<MetricsTable>) -> Self {
        Self {
            settings,
            local,
            by_peer: DashMap::new(),
        }
    }

    fn aggregate(&self) -> std::collections::BTreeMap<String, u64> {
        let mut totals: std::collections::BTreeMap<String, u64> = self.local.snapshot().into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        for entry in &self.by_peer {
            for (name, value) in entry.value() {
                *totals.entry(name.clone()).or_insert(0) += value;
            }
        }
        totals
    }
}

impl DaemonRoleHandler for Collector {
    fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = &self.settings;
        Ok(())
    }

    fn handle_message(&mut self, peer: PeerId, message: Message, reply: &ConnectionHandle) {
        match message {
            Message::Status { code: StatusCode::MetricsPush, description } => {
                match serde_json::from_str::<MetricsSnapshot>(&description) {
                    Ok(snapshot) => {
                        debug!(peer = %snapshot.peer_id, counters = snapshot.counters.len(), "metrics push received");
                        self.by_peer.insert(snapshot.peer_id, snapshot.counters);
                    }
                    Err(err) => debug!(%peer, %err, "dropping malformed metrics push"),
                }
            }
            Message::Status { code: StatusCode::Registered, .. } => {
                let dump = self.aggregate();
                let description = serde_json::to_string(&dump).unwrap_or_default();
                send_message(
                    reply,
                    &Message::Status {
                        code: StatusCode::MetricsPush,
                        description,
                    },
                );
            }
            Message::Ping => send_message(reply, &Message::Pong),
            _ => {}
        }
    }
}

/// Builds the `MetricsSnapshot` description a role periodically pushes to
/// its configured collector.
#[must_use]
pub fn snapshot_description(peer_id: &str, table: &MetricsTable) -> String {
    let snapshot = MetricsSnapshot {
        peer_id: peer_id.to_string(),
        counters: table.snapshot().into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    };
    serde_json::to_string(&snapshot).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_merges_local_and_peer_counters() {
        let local = Arc::new(MetricsTable::new());
        local.inc("cache_hit_direct");
        let settings = Arc::new(crate::config::Settings::load(None).unwrap());
        let collector = Collector::new(settings, local);
        collector.by_peer.insert(
            "10.0.0.1:8980".to_string(),
            std::collections::BTreeMap::from([("cache_hit_direct".to_string(), 3u64)]),
        );

        let totals = collector.aggregate();
        assert_eq!(totals.get("cache_hit_direct"), Some(&4));
    }
}
