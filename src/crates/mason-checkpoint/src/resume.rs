//! Resume planning: validate a checkpoint against the fresh graph and
//! apply it.

use crate::Checkpoint;
use mason_error::{BuildError, ErrorCode, Result};
use mason_graph::{BuildGraph, NodeStatus, TargetId};
use std::collections::{BTreeSet, HashMap};

/// The validated outcome: which nodes resume as done and which
/// reschedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub completed: Vec<TargetId>,
    pub rescheduled: Vec<TargetId>,
}

#[derive(Debug, Default)]
pub struct ResumePlanner;

impl ResumePlanner {
    pub fn new() -> Self {
        Self
    }

    /// Validate `checkpoint` against `graph`.
    ///
    /// `current_fingerprints` holds the freshly recomputed fingerprint
    /// per target (over the sources on disk now). Any drift (different
    /// target set, a checkpoint edge the graph lost, a completed node
    /// whose fingerprint changed) refuses with `StaleCheckpoint`.
    pub fn plan(
        &self,
        checkpoint: &Checkpoint,
        graph: &BuildGraph,
        current_fingerprints: &HashMap<TargetId, String>,
    ) -> Result<ResumePlan> {
        let graph_ids: BTreeSet<String> = graph.nodes().map(|n| n.id().to_string()).collect();
        let checkpoint_ids: BTreeSet<String> = checkpoint.statuses.keys().cloned().collect();
        if graph_ids != checkpoint_ids {
            let missing: Vec<&String> = checkpoint_ids.difference(&graph_ids).collect();
            let added: Vec<&String> = graph_ids.difference(&checkpoint_ids).collect();
            return Err(stale(format!(
                "target set changed (removed: {missing:?}, added: {added:?})"
            )));
        }

        // Every checkpointed edge must still exist; new edges are fine.
        for (id, deps) in &checkpoint.edges {
            let node = graph.node_checked(&TargetId::from(id.as_str()))?;
            for dep in deps {
                if !node.deps().iter().any(|d| d.as_str() == dep) {
                    return Err(stale(format!("edge {id} -> {dep} no longer exists")));
                }
            }
        }

        let mut completed = Vec::new();
        let mut rescheduled = Vec::new();
        for (id, status) in &checkpoint.statuses {
            let target_id = TargetId::from(id.as_str());
            match status {
                NodeStatus::Success | NodeStatus::Cached => {
                    let recorded = checkpoint.fingerprints.get(id).ok_or_else(|| {
                        stale(format!("completed node {id} has no recorded fingerprint"))
                    })?;
                    let current = current_fingerprints.get(&target_id).ok_or_else(|| {
                        stale(format!("no current fingerprint for completed node {id}"))
                    })?;
                    if recorded != current {
                        return Err(stale(format!("sources changed for completed node {id}")));
                    }
                    completed.push(target_id);
                }
                // Pending, Failed and Skipped all run again.
                _ => rescheduled.push(target_id),
            }
        }

        Ok(ResumePlan {
            completed,
            rescheduled,
        })
    }

    /// Mark completed nodes done in the fresh graph (with their
    /// fingerprints) and reset the rest to `Pending`.
    pub fn apply(
        &self,
        plan: &ResumePlan,
        checkpoint: &Checkpoint,
        graph: &BuildGraph,
    ) -> Result<()> {
        for id in &plan.completed {
            let node = graph.node_checked(id)?;
            let status = checkpoint.statuses[id.as_str()];
            node.restore_status(status);
            if let Some(fingerprint) = checkpoint.fingerprints.get(id.as_str()) {
                node.set_fingerprint(fingerprint);
            }
        }
        for id in &plan.rescheduled {
            graph.node_checked(id)?.reset_for_resume();
        }
        tracing::info!(
            completed = plan.completed.len(),
            rescheduled = plan.rescheduled.len(),
            "resume plan applied"
        );
        Ok(())
    }
}

fn stale(msg: impl Into<String>) -> BuildError {
    BuildError::new(ErrorCode::StaleCheckpoint, msg)
}
