//! Peer selection for the Emitter's remote dispatch path.
//!
//! Tracks each known Absorber's outstanding job count and picks the
//! least-loaded one, breaking ties randomly rather than always preferring
//! the lowest peer id — a fixed tie-break would pin load onto whichever
//! peer happens to sort first whenever two peers are equally idle.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use rand::seq::SliceRandom;

/// Health state of a known Absorber, as observed by the Coordinator poll
/// and the Emitter's own dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Healthy,
    Suspect,
    Down,
}

struct PeerState {
    outstanding: AtomicU32,
    health: parking_lot::Mutex<PeerHealth>,
}

/// Tracks outstanding job counts across a set of peers, keyed by an
/// arbitrary `Id` (an Absorber's `tcp://host:port` endpoint string in
/// practice).
pub struct WorkerSelector<Id: std::hash::Hash + Eq + Clone> {
    peers: DashMap<Id, PeerState>,
}

impl<Id: std::hash::Hash + Eq + Clone> Default for WorkerSelector<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: std::hash::Hash + Eq + Clone> WorkerSelector<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    pub fn upsert(&self, id: Id) {
        self.peers.entry(id).or_insert_with(|| PeerState {
            outstanding: AtomicU32::new(0),
            health: parking_lot::Mutex::new(PeerHealth::Healthy),
        });
    }

    pub fn remove(&self, id: &Id) {
        self.peers.remove(id);
    }

    pub fn set_health(&self, id: &Id, health: PeerHealth) {
        if let Some(state) = self.peers.get(id) {
            *state.health.lock() = health;
        }
    }

    /// Mark one job dispatched to `id`. Call exactly once per dispatch.
    pub fn mark_dispatched(&self, id: &Id) {
        if let Some(state) = self.peers.get(id) {
            state.outstanding.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Mark one job finished (success or failure) on `id`.
    pub fn mark_finished(&self, id: &Id) {
        if let Some(state) = self.peers.get(id) {
            state
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
                .ok();
        }
    }

    /// Pick the peer with the fewest outstanding jobs among `Healthy`
    /// peers, breaking ties uniformly at random. Returns `None` if no
    /// healthy peer is known.
    #[must_use]
    pub fn select(&self) -> Option<Id> {
        self.select_below(u32::MAX)
    }

    /// Like [`Self::select`], but also excludes any `Healthy` peer whose
    /// outstanding count has already reached `max_in_flight` — a peer at
    /// its cap is skipped even if it's still the least-loaded one known,
    /// so one slow Absorber can't monopolize every dispatch.
    #[must_use]
    pub fn select_below(&self, max_in_flight: u32) -> Option<Id> {
        let mut min_load = u32::MAX;
        let mut candidates: Vec<Id> = Vec::new();

        for entry in self.peers.iter() {
            if *entry.value().health.lock() != PeerHealth::Healthy {
                continue;
            }
            let load = entry.value().outstanding.load(Ordering::Acquire);
            if load >= max_in_flight {
                continue;
            }
            match load.cmp(&min_load) {
                std::cmp::Ordering::Less => {
                    min_load = load;
                    candidates.clear();
                    candidates.push(entry.key().clone());
                }
                std::cmp::Ordering::Equal => candidates.push(entry.key().clone()),
                std::cmp::Ordering::Greater => {}
            }
        }

        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|e| *e.value().health.lock() == PeerHealth::Healthy)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_least_loaded() {
        let selector: WorkerSelector<&str> = WorkerSelector::new();
        selector.upsert("a");
        selector.upsert("b");
        selector.mark_dispatched(&"a");
        selector.mark_dispatched(&"a");
        selector.mark_dispatched(&"b");

        assert_eq!(selector.select(), Some("b"));
    }

    #[test]
    fn skips_unhealthy_peers() {
        let selector: WorkerSelector<&str> = WorkerSelector::new();
        selector.upsert("a");
        selector.upsert("b");
        selector.set_health(&"a", PeerHealth::Down);

        assert_eq!(selector.select(), Some("b"));
    }

    #[test]
    fn no_healthy_peers_returns_none() {
        let selector: WorkerSelector<&str> = WorkerSelector::new();
        selector.upsert("a");
        selector.set_health(&"a", PeerHealth::Down);
        assert_eq!(selector.select(), None);
    }

    #[test]
    fn select_below_skips_peers_at_cap() {
        let selector: WorkerSelector<&str> = WorkerSelector::new();
        selector.upsert("a");
        selector.upsert("b");
        selector.mark_dispatched(&"a");
        selector.mark_dispatched(&"a");
        selector.mark_dispatched(&"b");
        selector.mark_dispatched(&"b");

        // "b" is the least loaded overall once "a" grows further below, but
        // a cap of 2 excludes "b" too, leaving no candidate.
        selector.mark_dispatched(&"a");
        assert_eq!(selector.select_below(2), None);
    }

    #[test]
    fn finish_reduces_load() {
        let selector: WorkerSelector<&str> = WorkerSelector::new();
        selector.upsert("a");
        selector.upsert("b");
        selector.mark_dispatched(&"a");
        selector.mark_finished(&"a");
        selector.mark_dispatched(&"b");

        assert_eq!(selector.select(), Some("a"));
    }
}
