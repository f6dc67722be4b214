//! Graph-resident runtime state for a single target.

use crate::{Target, TargetId};
use mason_error::{BuildError, ErrorCode, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle state of a build node.
///
/// Transitions are monotonic within one attempt; only a resume resets a
/// node to `Pending`. `Cached` satisfies dependents identically to
/// `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Analyzing = 1,
    Ready = 2,
    Running = 3,
    Success = 4,
    Cached = 5,
    Failed = 6,
    Skipped = 7,
}

impl NodeStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeStatus::Pending,
            1 => NodeStatus::Analyzing,
            2 => NodeStatus::Ready,
            3 => NodeStatus::Running,
            4 => NodeStatus::Success,
            5 => NodeStatus::Cached,
            6 => NodeStatus::Failed,
            _ => NodeStatus::Skipped,
        }
    }

    /// Terminal states never transition again within an attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Cached | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// Whether this status satisfies a dependent's readiness check.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Cached)
    }

    fn can_advance_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Pending, Analyzing) | (Pending, Ready) | (Pending, Skipped) => true,
            (Analyzing, Ready) | (Analyzing, Cached) | (Analyzing, Failed) | (Analyzing, Skipped) => true,
            (Ready, Running) | (Ready, Skipped) => true,
            (Running, Success) | (Running, Cached) | (Running, Failed) => true,
            _ => false,
        }
    }
}

/// Runtime projection of a [`Target`] inside the graph.
///
/// Status is an atomic so the executing workers share the graph by
/// reference; everything else is fixed at construction or guarded by a
/// short-held mutex (fingerprint, output hash).
#[derive(Debug)]
pub struct BuildNode {
    id: TargetId,
    target: Arc<Target>,
    status: AtomicU8,
    /// Outbound edges: ids this node depends on.
    deps: Vec<TargetId>,
    /// Inbound edges: ids that depend on this node.
    dependents: Vec<TargetId>,
    /// Longest dependency path below this node; 0 for leaf targets.
    depth: usize,
    /// Fingerprint once computed, hex-encoded.
    fingerprint: Mutex<Option<String>>,
    /// Hash of the last produced output, hex-encoded.
    output_hash: Mutex<Option<String>>,
    /// Last observed build duration in milliseconds; scheduling estimate.
    cost_estimate_ms: AtomicU64,
}

impl BuildNode {
    pub(crate) fn new(target: Arc<Target>) -> Self {
        Self {
            id: target.id.clone(),
            // Edges are wired by the graph via add_edge, never here:
            // dependency ids in the Target may be forward references.
            deps: Vec::new(),
            dependents: Vec::new(),
            depth: 0,
            status: AtomicU8::new(NodeStatus::Pending as u8),
            fingerprint: Mutex::new(None),
            output_hash: Mutex::new(None),
            cost_estimate_ms: AtomicU64::new(0),
            target,
        }
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    pub fn deps(&self) -> &[TargetId] {
        &self.deps
    }

    pub fn dependents(&self) -> &[TargetId] {
        &self.dependents
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn push_dependent(&mut self, id: TargetId) {
        if !self.dependents.contains(&id) {
            self.dependents.push(id);
        }
    }

    pub(crate) fn push_dep(&mut self, id: TargetId) {
        if !self.deps.contains(&id) {
            self.deps.push(id);
        }
    }

    pub(crate) fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Advance the node's status, enforcing the monotonic transition set.
    ///
    /// Returns `GraphInvalid` on an illegal transition so scheduler bugs
    /// surface instead of corrupting the lifecycle.
    pub fn transition(&self, next: NodeStatus) -> Result<()> {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let current_status = NodeStatus::from_u8(current);
            if current_status == next {
                return Ok(());
            }
            if !current_status.can_advance_to(next) {
                return Err(BuildError::new(
                    ErrorCode::GraphInvalid,
                    format!(
                        "illegal status transition {:?} -> {:?} for {}",
                        current_status, next, self.id
                    ),
                ));
            }
            match self.status.compare_exchange(
                current,
                next as u8,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Claim the node for processing: a single CAS from `Pending` to
    /// `Analyzing`. Exactly one racing worker wins; the rest skip.
    pub fn begin_analysis(&self) -> bool {
        self.status
            .compare_exchange(
                NodeStatus::Pending as u8,
                NodeStatus::Analyzing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reset to `Pending`, permitted only when re-scheduling on resume.
    pub fn reset_for_resume(&self) {
        self.status.store(NodeStatus::Pending as u8, Ordering::Release);
        *self.fingerprint.lock() = None;
    }

    /// Restore a terminal status from a checkpoint without running the
    /// transition checks (the node never actually executed this attempt).
    pub fn restore_status(&self, status: NodeStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.fingerprint.lock().clone()
    }

    pub fn set_fingerprint(&self, fingerprint: impl Into<String>) {
        *self.fingerprint.lock() = Some(fingerprint.into());
    }

    pub fn output_hash(&self) -> Option<String> {
        self.output_hash.lock().clone()
    }

    pub fn set_output_hash(&self, hash: impl Into<String>) {
        *self.output_hash.lock() = Some(hash.into());
    }

    /// Scheduling cost estimate: last observed duration, fallback 1.
    pub fn cost_estimate_ms(&self) -> u64 {
        match self.cost_estimate_ms.load(Ordering::Relaxed) {
            0 => 1,
            ms => ms,
        }
    }

    pub fn record_duration_ms(&self, ms: u64) {
        self.cost_estimate_ms.store(ms.max(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TargetKind;

    fn node(id: &str) -> BuildNode {
        BuildNode::new(Arc::new(Target::new(id, TargetKind::Library, "rust")))
    }

    #[test]
    fn test_happy_path_transitions() {
        let n = node("//a:a");
        assert_eq!(n.status(), NodeStatus::Pending);
        n.transition(NodeStatus::Analyzing).unwrap();
        n.transition(NodeStatus::Ready).unwrap();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::Success).unwrap();
        assert_eq!(n.status(), NodeStatus::Success);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let n = node("//a:a");
        n.transition(NodeStatus::Ready).unwrap();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::Failed).unwrap();
        assert!(n.transition(NodeStatus::Running).is_err());
        assert!(n.transition(NodeStatus::Success).is_err());
    }

    #[test]
    fn test_no_backwards_transition() {
        let n = node("//a:a");
        n.transition(NodeStatus::Ready).unwrap();
        assert!(n.transition(NodeStatus::Pending).is_err());
    }

    #[test]
    fn test_same_status_is_idempotent() {
        let n = node("//a:a");
        n.transition(NodeStatus::Ready).unwrap();
        n.transition(NodeStatus::Ready).unwrap();
        assert_eq!(n.status(), NodeStatus::Ready);
    }

    #[test]
    fn test_resume_reset() {
        let n = node("//a:a");
        n.transition(NodeStatus::Ready).unwrap();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::Failed).unwrap();
        n.set_fingerprint("abcd");
        n.reset_for_resume();
        assert_eq!(n.status(), NodeStatus::Pending);
        assert!(n.fingerprint().is_none());
    }

    #[test]
    fn test_cached_satisfies_dependents() {
        assert!(NodeStatus::Cached.satisfies_dependents());
        assert!(NodeStatus::Success.satisfies_dependents());
        assert!(!NodeStatus::Failed.satisfies_dependents());
        assert!(!NodeStatus::Running.satisfies_dependents());
    }

    #[test]
    fn test_cost_estimate_fallback() {
        let n = node("//a:a");
        assert_eq!(n.cost_estimate_ms(), 1);
        n.record_duration_ms(250);
        assert_eq!(n.cost_estimate_ms(), 250);
    }
}
