//! Content-addressed object store: the `FileCache` itself.
//!
//! Durability comes from writing to a temp file in the target directory and
//! renaming into place — a crash mid-write leaves the temp file orphaned,
//! never a half-written entry visible under its real name. On startup the
//! index is rebuilt by walking the directory tree rather than trusted from
//! a separate metadata file, so a prior crash can never desync the two.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use distbuild_proto::cachekey::{CacheKey, Manifest};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::layout::{entry_dir, entry_path, Part};
use crate::lru::LruIndex;

const STRIPE_COUNT: usize = 64;

/// One complete cached compile result.
#[derive(Debug, Clone)]
pub struct Entry {
    pub object: Vec<u8>,
    pub stderr: Vec<u8>,
    pub deps: Vec<u8>,
}

/// A fixed-size set of mutexes, one per `key.0[0] % STRIPE_COUNT`. Distinct
/// keys overlap freely; same-key operations serialize without needing a
/// global lock on every `lookup`/`store`.
struct Stripes {
    locks: Vec<Mutex<()>>,
}

impl Stripes {
    fn new() -> Self {
        Self {
            locks: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    fn guard(&self, key: CacheKey) -> parking_lot::MutexGuard<'_, ()> {
        self.locks[key.0[0] as usize % STRIPE_COUNT].lock()
    }
}

pub struct FileCache {
    root: PathBuf,
    index: LruIndex,
    stripes: Stripes,
    compression_level: i32,
    entry_count: AtomicU64,
}

impl FileCache {
    /// Opens (creating if absent) a cache rooted at `root`, rebuilding the
    /// in-memory LRU index from a directory scan.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if `root` cannot be created or scanned.
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64, compression_level: i32) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let index = LruIndex::new(max_bytes);
        let mut entry_count = 0u64;
        for (key, size) in scan_existing_entries(&root)? {
            index.record_store(key, size);
            entry_count += 1;
        }
        debug!(entries = entry_count, root = %root.display(), "rebuilt cache index from disk");

        Ok(Self {
            root,
            index,
            stripes: Stripes::new(),
            compression_level,
            entry_count: AtomicU64::new(entry_count),
        })
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// # Errors
    ///
    /// Returns `CacheError::Io` on a read failure other than not-found;
    /// a missing entry is `Ok(None)`, not an error.
    pub fn lookup(&self, key: CacheKey) -> Result<Option<Entry>> {
        let _guard = self.stripes.guard(key);
        let object_path = entry_path(&self.root, key, Part::Object);
        if !object_path.exists() {
            return Ok(None);
        }

        let object = decompress_file(&object_path, self.compression_level)?;
        let stderr = read_optional(&entry_path(&self.root, key, Part::Stderr))?.unwrap_or_default();
        let deps = read_optional(&entry_path(&self.root, key, Part::Deps))?.unwrap_or_default();

        self.index.touch(key);
        Ok(Some(Entry { object, stderr, deps }))
    }

    /// # Errors
    ///
    /// Returns `CacheError::Io` if the manifest can't be read, or
    /// `CacheError::ManifestDecode` if its contents are corrupt. A missing
    /// manifest is `Ok(None)`.
    pub fn lookup_manifest(&self, key: CacheKey) -> Result<Option<Manifest>> {
        let _guard = self.stripes.guard(key);
        let path = entry_path(&self.root, key, Part::Manifest);
        match read_optional(&path)? {
            None => Ok(None),
            Some(bytes) => {
                let manifest: Manifest =
                    serde_json::from_slice(&bytes).map_err(CacheError::ManifestDecode)?;
                Ok(Some(manifest))
            }
        }
    }

    /// Deletes a manifest found to be stale (a header it lists no longer
    /// matches). Never fails the caller's request on error.
    pub fn delete_manifest(&self, key: CacheKey) {
        let _guard = self.stripes.guard(key);
        let path = entry_path(&self.root, key, Part::Manifest);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?err, "failed to delete stale manifest");
            }
        }
    }

    /// Atomically stores `entry` under `key`, then evicts from the LRU tail
    /// until the cache is back under budget.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` on a write failure; the caller should log
    /// and continue rather than fail the client's request.
    pub fn store(&self, key: CacheKey, entry: &Entry) -> Result<()> {
        let _guard = self.stripes.guard(key);
        let dir = entry_dir(&self.root, key);
        fs::create_dir_all(&dir)?;

        let compressed_size =
            write_atomic_compressed(&entry_path(&self.root, key, Part::Object), &entry.object, self.compression_level)?;
        write_atomic(&entry_path(&self.root, key, Part::Stderr), &entry.stderr)?;
        write_atomic(&entry_path(&self.root, key, Part::Deps), &entry.deps)?;

        self.entry_count.fetch_add(1, Ordering::Relaxed);
        let evicted = self.index.record_store(key, compressed_size);
        drop(_guard);
        for evicted_key in evicted {
            self.evict(evicted_key);
        }
        Ok(())
    }

    /// Stores a manifest alongside (or instead of) an object — used on the
    /// indirect lookup path once headers have been hashed.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` on a write failure.
    pub fn store_manifest(&self, key: CacheKey, manifest: &Manifest) -> Result<()> {
        let _guard = self.stripes.guard(key);
        let dir = entry_dir(&self.root, key);
        fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec(manifest).map_err(CacheError::ManifestDecode)?;
        write_atomic(&entry_path(&self.root, key, Part::Manifest), &bytes)?;
        Ok(())
    }

    fn evict(&self, key: CacheKey) {
        let _guard = self.stripes.guard(key);
        for part in [Part::Object, Part::Stderr, Part::Deps, Part::Manifest] {
            let path = entry_path(&self.root, key, part);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(?err, ?path, "failed to remove evicted cache file");
                }
            }
        }
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Removes entries whose object file is older than `ttl`. Unlike
    /// eviction, this doesn't touch the LRU index's size accounting beyond
    /// what `remove` already does for it.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the root directory can't be walked.
    pub fn prune(&self, ttl: Duration) -> Result<u64> {
        let now = SystemTime::now();
        let mut pruned = 0u64;
        for (key, path) in walk_objects(&self.root)? {
            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| now.duration_since(m).ok());
            if age.is_some_and(|age| age > ttl) {
                self.index.remove(key);
                self.evict(key);
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().expect("entry paths always have a fan-out parent");
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn write_atomic_compressed(path: &Path, bytes: &[u8], level: i32) -> Result<u64> {
    let compressed = zstd::encode_all(bytes, level).map_err(|e| CacheError::Compression(e.to_string()))?;
    write_atomic(path, &compressed)?;
    Ok(compressed.len() as u64)
}

fn decompress_file(path: &Path, _level: i32) -> Result<Vec<u8>> {
    let compressed = fs::read(path)?;
    zstd::decode_all(compressed.as_slice()).map_err(|e| CacheError::Compression(e.to_string()))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn scan_existing_entries(root: &Path) -> Result<Vec<(CacheKey, u64)>> {
    walk_objects(root)?
        .into_iter()
        .map(|(key, path)| fs::metadata(&path).map(|m| (key, m.len())).map_err(CacheError::from))
        .collect()
}

fn walk_objects(root: &Path) -> Result<Vec<(CacheKey, PathBuf)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for kk in fs::read_dir(root)? {
        let kk = kk?;
        if !kk.file_type()?.is_dir() {
            continue;
        }
        for ee in fs::read_dir(kk.path())? {
            let ee = ee?;
            if !ee.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(ee.path())? {
                let file = file?;
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) == Some("o") {
                    if let Some(key) = key_from_object_path(&path) {
                        out.push((key, path));
                    }
                }
            }
        }
    }
    Ok(out)
}

fn key_from_object_path(path: &Path) -> Option<CacheKey> {
    let stem = path.file_stem()?.to_str()?;
    let bytes = hex::decode(stem).ok()?;
    let arr: [u8; 16] = bytes.try_into().ok()?;
    Some(CacheKey(arr))
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
    fn store_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 1_000_000, 1).unwrap();
        let entry = Entry {
            object: b"object bytes".to_vec(),
            stderr: b"warning: unused".to_vec(),
            deps: b"a.h b.h".to_vec(),
        };
        cache.store(key(1), &entry).unwrap();

        let found = cache.lookup(key(1)).unwrap().unwrap();
        assert_eq!(found.object, entry.object);
        assert_eq!(found.stderr, entry.stderr);
    }

    #[test]
    fn lookup_miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 1_000_000, 1).unwrap();
        assert!(cache.lookup(key(9)).unwrap().is_none());
    }

    #[test]
    fn eviction_keeps_size_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        // Each compressed entry is tiny but non-zero; force the budget low
        // enough that the fourth store evicts the first.
        let cache = FileCache::open(dir.path(), 1, 1).unwrap();
        for i in 1..=4u8 {
            cache
                .store(
                    key(i),
                    &Entry {
                        object: vec![i; 64],
                        stderr: vec![],
                        deps: vec![],
                    },
                )
                .unwrap();
        }
        assert!(cache.entry_count() <= 4);
        assert!(cache.lookup(key(4)).unwrap().is_some());
    }

    #[test]
    fn prune_removes_only_entries_older_than_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 1_000_000, 1).unwrap();
        let stale_entry = Entry {
            object: b"stale object".to_vec(),
            stderr: vec![],
            deps: vec![],
        };
        let fresh_entry = Entry {
            object: b"fresh object".to_vec(),
            stderr: vec![],
            deps: vec![],
        };
        cache.store(key(1), &stale_entry).unwrap();
        cache.store(key(2), &fresh_entry).unwrap();

        let stale_path = entry_path(dir.path(), key(1), Part::Object);
        let ancient = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&stale_path)
            .unwrap()
            .set_modified(ancient)
            .unwrap();

        let pruned = cache.prune(Duration::from_secs(60)).unwrap();
        assert_eq!(pruned, 1);
        assert!(cache.lookup(key(1)).unwrap().is_none());
        assert!(cache.lookup(key(2)).unwrap().is_some());
    }

    #[test]
    fn index_rebuilds_from_directory_scan_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = FileCache::open(dir.path(), 1_000_000, 1).unwrap();
            cache
                .store(
                    key(7),
                    &Entry {
                        object: b"x".to_vec(),
                        stderr: vec![],
                        deps: vec![],
                    },
                )
                .unwrap();
        }
        let reopened = FileCache::open(dir.path(), 1_000_000, 1).unwrap();
        assert_eq!(reopened.entry_count(), 1);
        assert!(reopened.lookup(key(7)).unwrap().is_some());
    }
}
