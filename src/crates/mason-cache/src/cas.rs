//! Content-addressable blob store.
//!
//! Blobs live at `cas/blobs/<xx>/<remaining-hex>` where `xx` is the first
//! two hex characters of the blake3 hash. The store is write-once: a blob
//! at hash H is bit-identical on every write, so re-putting existing
//! bytes is a metadata-only no-op. Writes go through a temp file and an
//! atomic rename; reads are lock-free (blobs are immutable).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mason_error::{BuildError, ErrorCode, Result, ResultExt};
use parking_lot::Mutex;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Dedup accounting: `total_offered` counts every byte handed to `put`,
/// `unique_bytes` only those that created a new blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CasStats {
    pub blobs: u64,
    pub unique_bytes: u64,
    pub total_offered: u64,
}

impl CasStats {
    /// unique bytes / total offered; 1.0 for an empty store.
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_offered == 0 {
            1.0
        } else {
            self.unique_bytes as f64 / self.total_offered as f64
        }
    }
}

#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    stats: Mutex<CasStats>,
}

impl ContentStore {
    /// Open (and create) a store rooted at `<root>/cas`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into().join("cas");
        fs::create_dir_all(root.join("blobs")).context("create_cas_dirs", root.display())?;
        fs::create_dir_all(root.join("tmp")).context("create_cas_dirs", root.display())?;
        let store = Self {
            root,
            stats: Mutex::new(CasStats::default()),
        };
        store.rescan()?;
        Ok(store)
    }

    /// Store bytes, returning their hex hash. Duplicate content costs
    /// O(1) extra bytes: only the stats counter moves.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = blake3::hash(bytes).to_hex().to_string();
        let path = self.blob_path(&hash);

        {
            let mut stats = self.stats.lock();
            stats.total_offered += bytes.len() as u64;
        }

        if path.exists() {
            return Ok(hash);
        }

        let tmp_dir = self.root.join("tmp");
        fs::create_dir_all(&tmp_dir).context("create_cas_tmp", tmp_dir.display())?;
        let tmp = tmp_dir.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(path.parent().expect("blob paths have parents"))
            .context("create_blob_shard", path.display())?;
        fs::write(&tmp, bytes).context("write_blob_tmp", tmp.display())?;
        // Atomic publish; a concurrent writer racing to the same hash
        // produces identical bytes, so either rename winning is correct.
        fs::rename(&tmp, &path).context("publish_blob", path.display())?;
        self.write_meta(&hash, bytes.len() as u64, false)?;

        let mut stats = self.stats.lock();
        stats.blobs += 1;
        stats.unique_bytes += bytes.len() as u64;
        Ok(hash)
    }

    /// Fetch a blob's bytes.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        validate_hash(hash)?;
        let path = self.blob_path(hash);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::new(ErrorCode::FileNotFound, format!("no blob {hash}"))
            } else {
                BuildError::from(e)
            }
        })
    }

    pub fn contains(&self, hash: &str) -> bool {
        validate_hash(hash).is_ok() && self.blob_path(hash).exists()
    }

    /// Remove a blob and its meta sibling. Used only by the garbage
    /// collector.
    pub(crate) fn remove(&self, hash: &str) -> Result<u64> {
        validate_hash(hash)?;
        let path = self.blob_path(hash);
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        fs::remove_file(&path).context("remove_blob", path.display())?;
        let _ = fs::remove_file(meta_path(&path));
        let mut stats = self.stats.lock();
        stats.blobs = stats.blobs.saturating_sub(1);
        stats.unique_bytes = stats.unique_bytes.saturating_sub(size);
        Ok(size)
    }

    /// All blob hashes currently on disk, with their modification times.
    pub fn list(&self) -> Result<Vec<(String, std::time::SystemTime)>> {
        let mut out = Vec::new();
        let blobs_dir = self.root.join("blobs");
        for shard in fs::read_dir(&blobs_dir).context("list_cas", blobs_dir.display())? {
            let shard = shard.context("list_cas", blobs_dir.display())?;
            if !shard.path().is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().to_string();
            for entry in fs::read_dir(shard.path()).context("list_cas_shard", prefix.clone())? {
                let entry = entry.context("list_cas_shard", prefix.clone())?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".meta") {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                out.push((format!("{prefix}{name}"), modified));
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> CasStats {
        *self.stats.lock()
    }

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let (prefix, rest) = hash.split_at(2.min(hash.len()));
        self.root.join("blobs").join(prefix).join(rest)
    }

    /// Length + compression flag sidecar, big-endian.
    fn write_meta(&self, hash: &str, len: u64, compressed: bool) -> Result<()> {
        let mut meta = Vec::with_capacity(9);
        meta.write_u64::<BigEndian>(len).expect("vec write");
        meta.write_u8(u8::from(compressed)).expect("vec write");
        let path = meta_path(&self.blob_path(hash));
        fs::write(&path, meta).context("write_blob_meta", path.display())?;
        Ok(())
    }

    /// Read a blob's meta sidecar: (length, compressed flag).
    pub fn read_meta(&self, hash: &str) -> Result<(u64, bool)> {
        let path = meta_path(&self.blob_path(hash));
        let bytes = fs::read(&path).context("read_blob_meta", path.display())?;
        let slice: &[u8] = &bytes;
        let mut cursor = Cursor::new(slice);
        let len = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| BuildError::new(ErrorCode::CacheCorrupted, "truncated blob meta"))?;
        let compressed = cursor
            .read_u8()
            .map_err(|_| BuildError::new(ErrorCode::CacheCorrupted, "truncated blob meta"))?;
        Ok((len, compressed != 0))
    }

    /// Rebuild stats from disk on open.
    fn rescan(&self) -> Result<()> {
        let mut blobs = 0u64;
        let mut unique = 0u64;
        for (hash, _) in self.list()? {
            blobs += 1;
            if let Ok(meta) = fs::metadata(self.blob_path(&hash)) {
                unique += meta.len();
            }
        }
        let mut stats = self.stats.lock();
        stats.blobs = blobs;
        stats.unique_bytes = unique;
        stats.total_offered = unique;
        Ok(())
    }
}

/// Keys must be well-formed 256-bit hex. Anything else never came from
/// the hash function and must not be turned into a filesystem path.
fn validate_hash(hash: &str) -> Result<()> {
    let decoded = hex::decode(hash)
        .map_err(|_| BuildError::new(ErrorCode::CacheCorrupted, format!("malformed blob key {hash:?}")))?;
    if decoded.len() != 32 {
        return Err(BuildError::new(
            ErrorCode::CacheCorrupted,
            format!("blob key {hash:?} is not a 256-bit digest"),
        ));
    }
    Ok(())
}

fn meta_path(blob_path: &Path) -> PathBuf {
    let mut name = blob_path
        .file_name()
        .expect("blob paths have file names")
        .to_os_string();
    name.push(".meta");
    blob_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ContentStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_tmp, store) = store();
        let hash = store.put(b"artifact bytes").unwrap();
        assert_eq!(store.get(&hash).unwrap(), b"artifact bytes");
    }

    #[test]
    fn test_layout_shards_by_hash_prefix() {
        let (_tmp, store) = store();
        let hash = store.put(b"x").unwrap();
        let path = store.blob_path(&hash);
        let shard = path.parent().unwrap().file_name().unwrap().to_string_lossy();
        assert_eq!(shard, &hash[..2]);
    }

    #[test]
    fn test_duplicate_put_is_noop() {
        let (_tmp, store) = store();
        store.put(b"same bytes").unwrap();
        let before = store.stats();
        store.put(b"same bytes").unwrap();
        let after = store.stats();

        assert_eq!(after.blobs, before.blobs);
        assert_eq!(after.unique_bytes, before.unique_bytes);
        assert_eq!(after.total_offered, before.total_offered + 9);
    }

    #[test]
    fn test_dedup_ratio() {
        let (_tmp, store) = store();
        store.put(b"0123456789").unwrap();
        store.put(b"0123456789").unwrap();
        assert!((store.stats().dedup_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let (_tmp, store) = store();
        let err = store.get(&"0".repeat(64)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn test_malformed_keys_never_touch_the_filesystem() {
        let (_tmp, store) = store();
        assert!(store.get("../../etc/passwd").is_err());
        assert!(store.get("zz not hex").is_err());
        assert!(store.get("abcd").is_err()); // valid hex, wrong width
        assert!(!store.contains("../escape"));
    }

    #[test]
    fn test_meta_sidecar() {
        let (_tmp, store) = store();
        let hash = store.put(b"12345").unwrap();
        let (len, compressed) = store.read_meta(&hash).unwrap();
        assert_eq!(len, 5);
        assert!(!compressed);
    }

    #[test]
    fn test_stats_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let hash = {
            let store = ContentStore::open(tmp.path()).unwrap();
            store.put(b"persistent").unwrap()
        };
        let reopened = ContentStore::open(tmp.path()).unwrap();
        assert!(reopened.contains(&hash));
        assert_eq!(reopened.stats().blobs, 1);
    }
}
