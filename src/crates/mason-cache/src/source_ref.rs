//! Deduplicated source snapshots: workspace paths tied to CAS blobs.
//!
//! Storing sources content-addressed means ten targets sharing a header
//! file cost one blob, and a snapshot of a target's inputs is just a
//! list of (path, hash) pairs.

use crate::ContentStore;
use mason_error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One workspace file pinned to the blob holding its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: PathBuf,
    pub blob_hash: String,
    pub size: u64,
}

/// A target's sources, snapshotted into the CAS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRefSet {
    pub refs: Vec<SourceRef>,
}

impl SourceRefSet {
    /// Snapshot `sources` (path, contents) into the store. Repeated
    /// contents land on the same blob.
    pub fn capture(
        store: &ContentStore,
        sources: &[(PathBuf, Vec<u8>)],
    ) -> Result<Self> {
        let mut refs = Vec::with_capacity(sources.len());
        for (path, contents) in sources {
            let blob_hash = store.put(contents)?;
            refs.push(SourceRef {
                path: path.clone(),
                blob_hash,
                size: contents.len() as u64,
            });
        }
        Ok(Self { refs })
    }

    /// Materialize every source's bytes back out of the store, in the
    /// captured order.
    pub fn restore(&self, store: &ContentStore) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let mut out = Vec::with_capacity(self.refs.len());
        for source_ref in &self.refs {
            let bytes = store.get(&source_ref.blob_hash)?;
            out.push((source_ref.path.clone(), bytes));
        }
        Ok(out)
    }

    /// Blob hashes this set keeps alive; garbage-collection roots.
    pub fn referenced_hashes(&self) -> Vec<String> {
        self.refs.iter().map(|r| r.blob_hash.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<(PathBuf, Vec<u8>)> {
        vec![
            ("src/lib.rs".into(), b"pub fn lib() {}".to_vec()),
            ("src/util.rs".into(), b"shared".to_vec()),
            // Same contents as util.rs from another path.
            ("src/copy.rs".into(), b"shared".to_vec()),
        ]
    }

    #[test]
    fn test_capture_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();

        let set = SourceRefSet::capture(&store, &sources()).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.restore(&store).unwrap(), sources());
    }

    #[test]
    fn test_identical_contents_share_a_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();

        let set = SourceRefSet::capture(&store, &sources()).unwrap();
        assert_eq!(set.refs[1].blob_hash, set.refs[2].blob_hash);
        // Three refs, two unique blobs.
        assert_eq!(store.stats().blobs, 2);
    }

    #[test]
    fn test_referenced_hashes_cover_every_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let set = SourceRefSet::capture(&store, &sources()).unwrap();
        let hashes = set.referenced_hashes();
        assert_eq!(hashes.len(), 3);
        for source_ref in &set.refs {
            assert!(hashes.contains(&source_ref.blob_hash));
        }
    }
}
