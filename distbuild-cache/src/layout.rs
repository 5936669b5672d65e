//! On-disk path layout: two hex-byte fan-out directories, capping each leaf
//! directory at roughly 65k entries the way a single flat directory of
//! hashes never would.

use std::path::{Path, PathBuf};

use distbuild_proto::cachekey::CacheKey;

/// The four files one cache entry is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Object,
    Stderr,
    Deps,
    Manifest,
}

impl Part {
    const fn extension(self) -> &'static str {
        match self {
            Self::Object => "o",
            Self::Stderr => "stderr",
            Self::Deps => "d",
            Self::Manifest => "manifest",
        }
    }
}

/// `<root>/<kk>/<ee>/<full-hash>.<ext>`
#[must_use]
pub fn entry_path(root: &Path, key: CacheKey, part: Part) -> PathBuf {
    let (kk, ee) = key.dir_prefix();
    root.join(format!("{kk:02x}"))
        .join(format!("{ee:02x}"))
        .join(format!("{}.{}", key.to_hex(), part.extension()))
}

/// The fan-out directory an entry's files live under, without the
/// filename — used to `create_dir_all` before a write.
#[must_use]
pub fn entry_dir(root: &Path, key: CacheKey) -> PathBuf {
    let (kk, ee) = key.dir_prefix();
    root.join(format!("{kk:02x}")).join(format!("{ee:02x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_uses_first_two_hash_bytes_as_fanout() {
        let key = CacheKey([0xAB, 0xCD, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let root = Path::new("/cache");
        let path = entry_path(root, key, Part::Object);
        assert_eq!(path, Path::new("/cache/ab/cd").join(format!("{}.o", key.to_hex())));
    }
}
