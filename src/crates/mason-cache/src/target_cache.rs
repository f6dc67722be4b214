//! Target cache: fingerprint -> artifact metadata.
//!
//! The canonical source of truth for incremental builds. Memory-resident
//! with a periodic flush to a versioned binary index (magic `BTLM`, all
//! integers big-endian, timestamps as u64 epoch milliseconds).

use crate::codec;
use crate::Fingerprint;
use chrono::{DateTime, TimeZone, Utc};
use mason_error::{Result, ResultExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;

pub(crate) const TARGET_INDEX_MAGIC: u32 = 0x4254_4C4D; // "BTLM"
pub(crate) const TARGET_INDEX_VERSION: u8 = 1;

/// Where an artifact's bytes live and how big they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// CAS hash of the artifact bytes.
    pub content_hash: String,
    pub size: u64,
    pub compressed_size: u64,
    pub timestamp: DateTime<Utc>,
    /// Tag of the workspace that produced the artifact.
    pub workspace_tag: String,
    pub compressed: bool,
}

/// One target-cache binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCacheEntry {
    pub fingerprint: Fingerprint,
    pub output_hash: String,
    pub metadata: ArtifactMetadata,
}

/// The local target cache tier.
///
/// All access goes through one short-held mutex; an insert is a single
/// map write, so a binding is either fully visible or absent.
#[derive(Debug)]
pub struct TargetCache {
    entries: Mutex<HashMap<Fingerprint, TargetCacheEntry>>,
    index_path: PathBuf,
}

impl TargetCache {
    /// Open the cache, loading the index when one exists. A corrupt or
    /// unreadable index downgrades to an empty cache with a warning;
    /// it costs a rebuild, not a failure.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let index_path = dir.into().join("targets.bin");
        let entries = match Self::load_index(&index_path) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    path = %index_path.display(),
                    error = %err,
                    "target cache index unreadable, starting empty"
                );
                HashMap::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            index_path,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<TargetCacheEntry> {
        self.entries.lock().get(fingerprint).cloned()
    }

    pub fn insert(&self, entry: TargetCacheEntry) {
        self.entries
            .lock()
            .insert(entry.fingerprint.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Content hashes referenced by live entries; input to the garbage
    /// collector's mark phase.
    pub fn referenced_hashes(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut hashes = Vec::with_capacity(entries.len() * 2);
        for entry in entries.values() {
            hashes.push(entry.metadata.content_hash.clone());
            hashes.push(entry.output_hash.clone());
        }
        hashes
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        let _ = fs::remove_file(&self.index_path);
    }

    /// Write the index atomically (temp file + rename).
    pub fn flush(&self) -> Result<()> {
        let entries = self.entries.lock();
        let mut out = Vec::new();
        codec::write_envelope(&mut out, TARGET_INDEX_MAGIC, TARGET_INDEX_VERSION);
        let mut sorted: Vec<&TargetCacheEntry> = entries.values().collect();
        sorted.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        out.extend_from_slice(&(sorted.len() as u64).to_be_bytes());
        for entry in sorted {
            encode_entry(&mut out, entry);
        }
        drop(entries);

        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent).context("create_cache_dir", parent.display())?;
        }
        let tmp = self.index_path.with_extension("bin.tmp");
        fs::write(&tmp, &out).context("write_target_index", tmp.display())?;
        fs::rename(&tmp, &self.index_path)
            .context("publish_target_index", self.index_path.display())?;
        tracing::debug!(path = %self.index_path.display(), "target cache index flushed");
        Ok(())
    }

    fn load_index(path: &PathBuf) -> Result<HashMap<Fingerprint, TargetCacheEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(path).context("read_target_index", path.display())?;
        let slice: &[u8] = &bytes;
        let mut cursor = Cursor::new(slice);
        codec::check_envelope(
            &mut cursor,
            TARGET_INDEX_MAGIC,
            TARGET_INDEX_VERSION,
            "target index",
        )?;
        let count = codec::read_u64(&mut cursor, "target index count")?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let entry = decode_entry(&mut cursor)?;
            entries.insert(entry.fingerprint.clone(), entry);
        }
        Ok(entries)
    }
}

fn encode_entry(out: &mut Vec<u8>, entry: &TargetCacheEntry) {
    codec::write_str(out, entry.fingerprint.as_str());
    codec::write_str(out, &entry.output_hash);
    codec::write_str(out, &entry.metadata.content_hash);
    out.extend_from_slice(&entry.metadata.size.to_be_bytes());
    out.extend_from_slice(&entry.metadata.compressed_size.to_be_bytes());
    out.extend_from_slice(&(entry.metadata.timestamp.timestamp_millis() as u64).to_be_bytes());
    codec::write_str(out, &entry.metadata.workspace_tag);
    out.push(u8::from(entry.metadata.compressed));
}

fn decode_entry(cursor: &mut Cursor<&[u8]>) -> Result<TargetCacheEntry> {
    let fingerprint = Fingerprint::from_hex(codec::read_str(cursor, "fingerprint")?);
    let output_hash = codec::read_str(cursor, "output hash")?;
    let content_hash = codec::read_str(cursor, "content hash")?;
    let size = codec::read_u64(cursor, "size")?;
    let compressed_size = codec::read_u64(cursor, "compressed size")?;
    let millis = codec::read_u64(cursor, "timestamp")?;
    let timestamp = Utc
        .timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| codec::corrupted("timestamp out of range"))?;
    let workspace_tag = codec::read_str(cursor, "workspace tag")?;
    let compressed = codec::read_u8(cursor, "compressed flag")? != 0;
    Ok(TargetCacheEntry {
        fingerprint,
        output_hash,
        metadata: ArtifactMetadata {
            content_hash,
            size,
            compressed_size,
            timestamp,
            workspace_tag,
            compressed,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: &str) -> TargetCacheEntry {
        TargetCacheEntry {
            fingerprint: Fingerprint::of_bytes(tag.as_bytes()),
            output_hash: format!("out-{tag}"),
            metadata: ArtifactMetadata {
                content_hash: format!("content-{tag}"),
                size: 1024,
                compressed_size: 512,
                timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
                workspace_tag: "ws".into(),
                compressed: true,
            },
        }
    }

    #[test]
    fn test_insert_get() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TargetCache::open(tmp.path());
        let e = entry("a");
        cache.insert(e.clone());
        assert_eq!(cache.get(&e.fingerprint), Some(e));
    }

    #[test]
    fn test_flush_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let e = entry("persist");
        {
            let cache = TargetCache::open(tmp.path());
            cache.insert(e.clone());
            cache.flush().unwrap();
        }
        let reloaded = TargetCache::open(tmp.path());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&e.fingerprint), Some(e));
    }

    #[test]
    fn test_index_magic_is_btlm() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TargetCache::open(tmp.path());
        cache.insert(entry("m"));
        cache.flush().unwrap();
        let bytes = fs::read(tmp.path().join("targets.bin")).unwrap();
        assert_eq!(&bytes[..4], b"BTLM");
        assert_eq!(bytes[4], 1);
    }

    #[test]
    fn test_corrupt_index_downgrades_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("targets.bin"), b"garbage").unwrap();
        let cache = TargetCache::open(tmp.path());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_version_rejected_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TargetCache::open(tmp.path());
        cache.insert(entry("v"));
        cache.flush().unwrap();

        let path = tmp.path().join("targets.bin");
        let mut bytes = fs::read(&path).unwrap();
        bytes[4] = 99;
        fs::write(&path, bytes).unwrap();

        let reloaded = TargetCache::open(tmp.path());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_timestamp_survives_round_trip_exactly() {
        let tmp = tempfile::tempdir().unwrap();
        let e = entry("t");
        {
            let cache = TargetCache::open(tmp.path());
            cache.insert(e.clone());
            cache.flush().unwrap();
        }
        let reloaded = TargetCache::open(tmp.path());
        let got = reloaded.get(&e.fingerprint).unwrap();
        assert_eq!(got.metadata.timestamp, e.metadata.timestamp);
    }

    #[test]
    fn test_referenced_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = TargetCache::open(tmp.path());
        cache.insert(entry("r"));
        let hashes = cache.referenced_hashes();
        assert!(hashes.contains(&"content-r".to_string()));
        assert!(hashes.contains(&"out-r".to_string()));
    }
}
