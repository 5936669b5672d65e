//! In-memory LRU index over cache keys, guarded by one global lock.
//!
//! All the index tracks is ordering and size; the actual entry bytes live
//! on disk and are never touched while this lock is held — readers and
//! writers of distinct keys overlap freely because the per-key mutual
//! exclusion lives one layer up, in `FileCache`.

use std::collections::VecDeque;

use distbuild_proto::cachekey::CacheKey;
use parking_lot::Mutex;

struct Inner {
    order: VecDeque<(CacheKey, u64)>,
    total_bytes: u64,
}

/// Tracks insertion/access order and total size so `FileCache::store` can
/// decide whether to evict, without needing to stat the filesystem.
pub struct LruIndex {
    inner: Mutex<Inner>,
    max_bytes: u64,
}

impl LruIndex {
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Record a freshly stored entry and evict from the tail until the
    /// total is within budget. Returns the keys evicted, in eviction order
    /// — the caller is responsible for deleting their files.
    pub fn record_store(&self, key: CacheKey, size_bytes: u64) -> Vec<CacheKey> {
        let mut inner = self.inner.lock();
        inner.order.retain(|(k, _)| *k != key);
        inner.order.push_back((key, size_bytes));
        inner.total_bytes += size_bytes;

        let mut evicted = Vec::new();
        while inner.total_bytes > self.max_bytes {
            let Some((evicted_key, evicted_size)) = inner.order.pop_front() else {
                break;
            };
            inner.total_bytes -= evicted_size;
            evicted.push(evicted_key);
        }
        evicted
    }

    /// Move `key` to the most-recently-used end on a successful lookup.
    pub fn touch(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.order.iter().position(|(k, _)| *k == key) {
            let entry = inner.order.remove(pos).expect("position just found");
            inner.order.push_back(entry);
        }
    }

    pub fn remove(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.order.iter().position(|(k, _)| *k == key) {
            let (_, size) = inner.order.remove(pos).expect("position just found");
            inner.total_bytes -= size;
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: CacheKey) -> bool {
        self.inner.lock().order.iter().any(|(k, _)| *k == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> CacheKey {
        let mut bytes = [0u8; 16];
        bytes[0] = b;
        CacheKey(bytes)
    }

    #[test]
    fn evicts_from_tail_once_over_budget() {
        let index = LruIndex::new(30);
        assert!(index.record_store(key(1), 10).is_empty());
        assert!(index.record_store(key(2), 10).is_empty());
        assert!(index.record_store(key(3), 10).is_empty());
        let evicted = index.record_store(key(4), 10);

        assert_eq!(evicted, vec![key(1)]);
        assert_eq!(index.total_bytes(), 30);
        assert!(!index.contains(key(1)));
        assert!(index.contains(key(2)));
        assert!(index.contains(key(4)));
    }

    #[test]
    fn touch_protects_from_next_eviction() {
        let index = LruIndex::new(20);
        index.record_store(key(1), 10);
        index.record_store(key(2), 10);
        index.touch(key(1));
        let evicted = index.record_store(key(3), 10);
        assert_eq!(evicted, vec![key(2)]);
    }
}
