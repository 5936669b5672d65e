//! Process-global metrics: plain atomics, no locks, cheap enough to bump on
//! every request. The Collector polls a snapshot of these periodically and
//! pushes them on; nothing here blocks or allocates on the increment path.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A monotonically increasing counter, identified by a short name.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A table of named counters, created on first use.
///
/// `distbuild`'s daemons share one `Arc<MetricsTable>` across every thread;
/// the Collector snapshot loop is the only reader that cares about the full
/// set, so lookups stay on a sharded `DashMap` rather than a single mutex.
#[derive(Debug, Default)]
pub struct MetricsTable {
    counters: DashMap<&'static str, Counter>,
}

impl MetricsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &'static str) {
        self.counters.entry(name).or_default().inc();
    }

    pub fn add(&self, name: &'static str, n: u64) {
        self.counters.entry(name).or_default().add(n);
    }

    /// Snapshot every counter's current value. Order is unspecified.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .iter()
            .map(|e| (*e.key(), e.value().get()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let table = MetricsTable::new();
        table.inc("cache_hit");
        table.inc("cache_hit");
        table.add("bytes_sent", 4096);

        let snapshot: std::collections::HashMap<_, _> = table.snapshot().into_iter().collect();
        assert_eq!(snapshot.get("cache_hit"), Some(&2));
        assert_eq!(snapshot.get("bytes_sent"), Some(&4096));
    }
}
