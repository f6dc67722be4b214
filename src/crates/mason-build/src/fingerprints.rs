//! Fingerprint recomputation over the workspace as it is now.
//!
//! Resume validation needs the current fingerprint of every target
//! without building anything: a topological walk feeding each node's
//! sources and its dependencies' already-computed fingerprints.

use mason_cache::{Fingerprint, FingerprintBuilder};
use mason_error::Result;
use mason_graph::{BuildGraph, TargetId};
use std::collections::HashMap;
use std::path::Path;

/// Compute fingerprints for every node whose sources are readable.
///
/// Unreadable sources simply leave the node out of the map; the resume
/// planner then treats a completed node without a current fingerprint
/// as stale, which is the right answer for a deleted source file.
pub fn compute_fingerprints(
    graph: &BuildGraph,
    workspace_root: &Path,
) -> Result<HashMap<TargetId, String>> {
    let order = graph.topological_order()?;
    let mut fingerprints: HashMap<TargetId, String> = HashMap::with_capacity(order.len());

    'nodes: for id in order {
        let node = graph.node_checked(&id)?;
        let target = node.target();

        let mut sources = Vec::with_capacity(target.sources.len());
        for path in &target.sources {
            match std::fs::read(workspace_root.join(path)) {
                Ok(contents) => sources.push((path.display().to_string(), contents)),
                Err(_) => continue 'nodes,
            }
        }

        let mut dep_fingerprints = Vec::with_capacity(node.deps().len());
        for dep in node.deps() {
            match fingerprints.get(dep) {
                Some(fingerprint) => dep_fingerprints
                    .push((dep.to_string(), Fingerprint::from_hex(fingerprint.clone()))),
                // A dep was skipped; this node's fingerprint would be
                // incomplete.
                None => continue 'nodes,
            }
        }

        let fingerprint = FingerprintBuilder::for_target(target, &sources, &dep_fingerprints);
        fingerprints.insert(id, fingerprint.to_string());
    }
    Ok(fingerprints)
}
