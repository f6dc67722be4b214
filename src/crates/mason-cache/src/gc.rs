//! Garbage collection over the content store.
//!
//! Mark phase gathers every hash referenced by the target and action
//! caches; sweep removes unreferenced blobs older than the retention
//! threshold. Young unreferenced blobs survive so a GC racing a build
//! never deletes artifacts that are about to be referenced.

use crate::{ActionCache, ContentStore, TargetCache};
use mason_error::Result;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub bytes_freed: u64,
    pub blobs_removed: u64,
    pub blobs_scanned: u64,
}

#[derive(Debug, Clone)]
pub struct GarbageCollector {
    retention: Duration,
}

impl GarbageCollector {
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }

    /// Sweep `store`, keeping everything in `extra_roots` plus whatever
    /// the caches reference.
    pub fn collect(
        &self,
        store: &ContentStore,
        target_cache: &TargetCache,
        action_cache: &ActionCache,
        extra_roots: &[String],
    ) -> Result<GcStats> {
        let mut referenced: HashSet<String> = HashSet::new();
        referenced.extend(target_cache.referenced_hashes());
        referenced.extend(action_cache.referenced_hashes());
        referenced.extend(extra_roots.iter().cloned());

        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut stats = GcStats::default();
        for (hash, modified) in store.list()? {
            stats.blobs_scanned += 1;
            if referenced.contains(&hash) || modified >= cutoff {
                continue;
            }
            match store.remove(&hash) {
                Ok(size) => {
                    stats.blobs_removed += 1;
                    stats.bytes_freed += size;
                }
                Err(err) => {
                    tracing::warn!(blob = %hash, error = %err, "gc failed to remove blob");
                }
            }
        }
        tracing::info!(
            removed = stats.blobs_removed,
            freed = stats.bytes_freed,
            scanned = stats.blobs_scanned,
            "garbage collection complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionCacheEntry, ActionId, ActionType, ArtifactMetadata, Fingerprint,
        TargetCacheEntry};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn caches(dir: &std::path::Path) -> (TargetCache, ActionCache) {
        (TargetCache::open(dir), ActionCache::open(dir))
    }

    #[test]
    fn test_referenced_blobs_survive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let (targets, actions) = caches(tmp.path());

        let kept = store.put(b"kept artifact").unwrap();
        targets.insert(TargetCacheEntry {
            fingerprint: Fingerprint::of_bytes(b"fp"),
            output_hash: kept.clone(),
            metadata: ArtifactMetadata {
                content_hash: kept.clone(),
                size: 13,
                compressed_size: 13,
                timestamp: Utc::now(),
                workspace_tag: "ws".into(),
                compressed: false,
            },
        });

        // Zero retention: everything unreferenced is eligible.
        let gc = GarbageCollector::new(Duration::ZERO);
        let stats = gc.collect(&store, &targets, &actions, &[]).unwrap();
        assert_eq!(stats.blobs_removed, 0);
        assert!(store.contains(&kept));
    }

    #[test]
    fn test_unreferenced_old_blob_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let (targets, actions) = caches(tmp.path());

        let orphan = store.put(b"orphan bytes").unwrap();
        let gc = GarbageCollector::new(Duration::ZERO);
        let stats = gc.collect(&store, &targets, &actions, &[]).unwrap();

        assert_eq!(stats.blobs_removed, 1);
        assert_eq!(stats.bytes_freed, 12);
        assert!(!store.contains(&orphan));
    }

    #[test]
    fn test_young_blob_survives_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let (targets, actions) = caches(tmp.path());

        let young = store.put(b"fresh").unwrap();
        let gc = GarbageCollector::new(Duration::from_secs(3600));
        let stats = gc.collect(&store, &targets, &actions, &[]).unwrap();

        assert_eq!(stats.blobs_removed, 0);
        assert!(store.contains(&young));
    }

    #[test]
    fn test_action_outputs_are_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let (targets, actions) = caches(tmp.path());

        let output = store.put(b"action output").unwrap();
        actions.insert(ActionCacheEntry {
            action: ActionId::new("//t:t", ActionType::Compile, "c", "ih"),
            input_hashes: vec!["ih".into()],
            output_hashes: vec![output.clone()],
            metadata: BTreeMap::new(),
            success: true,
            timestamp: Utc::now(),
            attempts: 0,
        });

        let gc = GarbageCollector::new(Duration::ZERO);
        gc.collect(&store, &targets, &actions, &[]).unwrap();
        assert!(store.contains(&output));
    }

    #[test]
    fn test_extra_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let (targets, actions) = caches(tmp.path());

        let pinned = store.put(b"pinned").unwrap();
        let gc = GarbageCollector::new(Duration::ZERO);
        gc.collect(&store, &targets, &actions, &[pinned.clone()]).unwrap();
        assert!(store.contains(&pinned));
    }
}
