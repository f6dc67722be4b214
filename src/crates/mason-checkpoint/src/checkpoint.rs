//! The checkpoint snapshot itself.

use chrono::{DateTime, Utc};
use mason_graph::{BuildGraph, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A snapshot of graph progress, serializable to the checkpoint file.
///
/// Everything is keyed by target-id string and kept in BTreeMaps so the
/// encoding, and therefore the workspace digest, is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub created_at: DateTime<Utc>,
    pub total_targets: u64,
    pub completed_targets: u64,
    pub failed_targets: Vec<String>,
    /// Per-node status at capture time.
    pub statuses: BTreeMap<String, NodeStatus>,
    /// id -> dependency ids, for the superset-edge validation.
    pub edges: BTreeMap<String, Vec<String>>,
    /// Fingerprints of nodes that were Success or Cached.
    pub fingerprints: BTreeMap<String, String>,
    /// Digest over topology + completed fingerprints.
    pub workspace_digest: String,
}

impl Checkpoint {
    /// Snapshot the graph's current state.
    pub fn capture(graph: &BuildGraph) -> Self {
        let mut statuses = BTreeMap::new();
        let mut edges = BTreeMap::new();
        let mut fingerprints = BTreeMap::new();
        let mut failed_targets = Vec::new();
        let mut completed = 0u64;

        for node in graph.nodes() {
            let id = node.id().to_string();
            let status = node.status();
            statuses.insert(id.clone(), status);
            edges.insert(
                id.clone(),
                node.deps().iter().map(|d| d.to_string()).collect(),
            );
            match status {
                NodeStatus::Success | NodeStatus::Cached => {
                    completed += 1;
                    if let Some(fingerprint) = node.fingerprint() {
                        fingerprints.insert(id, fingerprint);
                    }
                }
                NodeStatus::Failed => failed_targets.push(id),
                _ => {}
            }
        }

        let workspace_digest = digest_parts(&edges, &fingerprints);
        Self {
            created_at: Utc::now(),
            total_targets: graph.len() as u64,
            completed_targets: completed,
            failed_targets,
            statuses,
            edges,
            fingerprints,
            workspace_digest,
        }
    }

    pub fn pending_targets(&self) -> u64 {
        self.total_targets - self.completed_targets - self.failed_targets.len() as u64
            - self
                .statuses
                .values()
                .filter(|s| **s == NodeStatus::Skipped)
                .count() as u64
    }
}

/// Digest over graph topology plus completed-node fingerprints.
pub fn workspace_digest(graph: &BuildGraph) -> String {
    let mut edges = BTreeMap::new();
    let mut fingerprints = BTreeMap::new();
    for node in graph.nodes() {
        let id = node.id().to_string();
        edges.insert(
            id.clone(),
            node.deps().iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        );
        if node.status().satisfies_dependents() {
            if let Some(fingerprint) = node.fingerprint() {
                fingerprints.insert(id, fingerprint);
            }
        }
    }
    digest_parts(&edges, &fingerprints)
}

fn digest_parts(
    edges: &BTreeMap<String, Vec<String>>,
    fingerprints: &BTreeMap<String, String>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    for (id, deps) in edges {
        hasher.update(id.as_bytes());
        hasher.update(b"->");
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b";");
    }
    for (id, fingerprint) in fingerprints {
        hasher.update(id.as_bytes());
        hasher.update(b"=");
        hasher.update(fingerprint.as_bytes());
        hasher.update(b";");
    }
    hasher.finalize().to_hex().to_string()
}
