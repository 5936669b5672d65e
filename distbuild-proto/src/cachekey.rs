//! 128-bit cache key derivation and header manifests.
//!
//! Hashing uses MurmurHash3 x64-128: fast, well-distributed, and explicitly
//! not a security boundary. The transport this key travels over is a
//! trusted LAN or local socket, not an adversarial one.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::canon::{cache_key_projection, Command};

/// A 128-bit content-addressed cache key. Equality is byte equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub [u8; 16]);

impl CacheKey {
    #[must_use]
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// The first two hex bytes, used as the two-level fan-out directory
    /// prefix in `FileCache`'s on-disk layout.
    #[must_use]
    pub fn dir_prefix(self) -> (u8, u8) {
        (self.0[0], self.0[1])
    }
}

/// Exposed so callers building a `Manifest` (the Emitter, hashing each
/// dependency-file entry after a preprocess run) use the same hash as
/// `direct_key`/`manifest_key` without duplicating the murmur call.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> [u8; 16] {
    murmur128(data)
}

fn murmur128(data: &[u8]) -> [u8; 16] {
    let mut cursor = std::io::Cursor::new(data);
    let hash = murmur3::murmur3_x64_128(&mut cursor, 0).expect("reading from an in-memory buffer cannot fail");
    hash.to_be_bytes()
}

fn hash_parts(parts: &[&[u8]]) -> [u8; 16] {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(&(part.len() as u64).to_be_bytes());
        buf.extend_from_slice(part);
    }
    murmur128(&buf)
}

/// Direct-mode key: hash over the fully-preprocessed source.
///
/// Used on the miss-after-preprocess path; a hit here is authoritative.
#[must_use]
pub fn direct_key(cmd: &Command, compiler_version: &str, preprocessed_source: &[u8]) -> CacheKey {
    let projection = cache_key_projection(cmd);
    let flags_bytes = encode_projection(&projection);
    CacheKey(hash_parts(&[
        cmd.executable.as_bytes(),
        compiler_version.as_bytes(),
        &flags_bytes,
        preprocessed_source,
    ]))
}

/// Indirect (manifest) key: hash over raw source + flags, used on the
/// miss-before-preprocess path when the preprocessor hasn't run yet.
#[must_use]
pub fn manifest_key(cmd: &Command, compiler_version: &str, raw_source: &[u8]) -> CacheKey {
    let projection = cache_key_projection(cmd);
    let flags_bytes = encode_projection(&projection);
    CacheKey(hash_parts(&[
        b"manifest",
        cmd.executable.as_bytes(),
        compiler_version.as_bytes(),
        &flags_bytes,
        raw_source,
    ]))
}

fn encode_projection(projection: &BTreeMap<&'static str, String>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (k, v) in projection {
        buf.extend_from_slice(k.as_bytes());
        buf.push(0);
        buf.extend_from_slice(v.as_bytes());
        buf.push(0);
    }
    buf
}

/// A header consulted during a cached build, and the content hash it had at
/// that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub path: String,
    pub hash: [u8; 16],
}

/// Maps a `manifest_key` to the set of headers a prior build consulted plus
/// the direct key of the resulting object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub headers: Vec<ManifestHeader>,
    pub object_key: CacheKey,
    pub extra_files: Vec<CacheKey>,
}

impl Manifest {
    /// True iff every listed header still hashes equal on disk. A true
    /// result means `object_key` is still valid without rerunning the
    /// preprocessor.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a header path can no longer be read at all
    /// (as opposed to having merely changed) — the caller should treat that
    /// the same as an invalidated manifest.
    pub fn is_valid(&self) -> std::io::Result<bool> {
        for header in &self.headers {
            let contents = std::fs::read(Path::new(&header.path))?;
            if murmur128(&contents) != header.hash {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::{Action, FlagBuckets};

    fn sample_command() -> Command {
        Command {
            action: Action::Compile,
            executable: "clang++".into(),
            cwd: "/tmp".into(),
            args: vec![],
            env: vec![],
            inputs: vec!["a.cc".into()],
            output: Some("a.o".into()),
            language: None,
            flags: FlagBuckets::default(),
        }
    }

    #[test]
    fn direct_key_is_deterministic() {
        let cmd = sample_command();
        let k1 = direct_key(&cmd, "17.0.0", b"int main(){}");
        let k2 = direct_key(&cmd, "17.0.0", b"int main(){}");
        assert_eq!(k1, k2);
    }

    #[test]
    fn direct_key_changes_with_source() {
        let cmd = sample_command();
        let k1 = direct_key(&cmd, "17.0.0", b"int main(){}");
        let k2 = direct_key(&cmd, "17.0.0", b"int main(){return 1;}");
        assert_ne!(k1, k2);
    }

    #[test]
    fn manifest_invalidated_by_header_change() {
        let dir = tempfile::tempdir().unwrap();
        let header_path = dir.path().join("hdr.h");
        std::fs::write(&header_path, b"v1").unwrap();

        let manifest = Manifest {
            headers: vec![ManifestHeader {
                path: header_path.to_string_lossy().into_owned(),
                hash: murmur128(b"v1"),
            }],
            object_key: CacheKey([0u8; 16]),
            extra_files: vec![],
        };
        assert!(manifest.is_valid().unwrap());

        std::fs::write(&header_path, b"v2").unwrap();
        assert!(!manifest.is_valid().unwrap());
    }
}
