//! Worker identity, health ladder and the registry.

use mason_cache::ActionId;
use mason_error::{BuildError, ErrorCode, Result};
use mason_exec::Priority;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Stable worker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The health ladder. Missing heartbeats demote step by step; a
/// recovered worker climbs back through `Recovering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealth {
    Starting,
    Healthy,
    Degraded,
    Failing,
    Failed,
    Recovering,
}

impl WorkerHealth {
    /// Scheduling score contribution.
    pub fn score_bonus(self) -> f64 {
        match self {
            WorkerHealth::Healthy => 100.0,
            WorkerHealth::Degraded => 50.0,
            WorkerHealth::Recovering => 40.0,
            WorkerHealth::Failing | WorkerHealth::Starting => 25.0,
            WorkerHealth::Failed => 0.0,
        }
    }

    /// One step down the ladder.
    pub fn demoted(self) -> Self {
        match self {
            WorkerHealth::Healthy => WorkerHealth::Degraded,
            WorkerHealth::Degraded => WorkerHealth::Failing,
            WorkerHealth::Starting | WorkerHealth::Recovering | WorkerHealth::Failing => {
                WorkerHealth::Failed
            }
            WorkerHealth::Failed => WorkerHealth::Failed,
        }
    }

    /// Eligible to receive new work.
    pub fn schedulable(self) -> bool {
        !matches!(self, WorkerHealth::Failed | WorkerHealth::Failing)
    }
}

/// Everything the coordinator tracks per worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub health: WorkerHealth,
    /// Load factor in [0, 1].
    pub load: f64,
    pub completed: u64,
    pub failed: u64,
    /// Actions currently assigned, with their priorities.
    pub in_progress: HashMap<ActionId, Priority>,
    pub last_heartbeat: Instant,
}

impl WorkerInfo {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            health: WorkerHealth::Starting,
            load: 0.0,
            completed: 0,
            failed: 0,
            in_progress: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }

    /// Completions over total attempts; 0 for an unproven worker.
    pub fn completion_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.completed as f64 / total as f64
        }
    }
}

/// The set of known workers, behind one read-write lock.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerInfo>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: WorkerId) {
        self.workers.write().entry(id).or_insert_with(|| {
            tracing::info!(worker = %id, "worker registered");
            WorkerInfo::new(id)
        });
    }

    pub fn deregister(&self, id: &WorkerId) -> Option<WorkerInfo> {
        self.workers.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerInfo> {
        self.workers.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers.read().values().cloned().collect()
    }

    /// Record a heartbeat: refresh the timestamp, update load, and
    /// promote `Starting`/`Recovering` workers to `Healthy`.
    pub fn heartbeat(&self, id: &WorkerId, load: f64) -> Result<()> {
        let mut workers = self.workers.write();
        let info = workers.get_mut(id).ok_or_else(|| unknown_worker(id))?;
        info.last_heartbeat = Instant::now();
        info.load = load.clamp(0.0, 1.0);
        info.health = match info.health {
            WorkerHealth::Starting | WorkerHealth::Recovering | WorkerHealth::Degraded => {
                WorkerHealth::Healthy
            }
            WorkerHealth::Failed | WorkerHealth::Failing => WorkerHealth::Recovering,
            health => health,
        };
        Ok(())
    }

    pub fn set_health(&self, id: &WorkerId, health: WorkerHealth) -> Result<()> {
        let mut workers = self.workers.write();
        let info = workers.get_mut(id).ok_or_else(|| unknown_worker(id))?;
        info.health = health;
        Ok(())
    }

    /// Assign an action to a worker.
    pub fn claim_action(&self, id: &WorkerId, action: ActionId, priority: Priority) -> Result<()> {
        let mut workers = self.workers.write();
        let info = workers.get_mut(id).ok_or_else(|| unknown_worker(id))?;
        info.in_progress.insert(action, priority);
        Ok(())
    }

    /// Complete an action, updating the worker's counters.
    pub fn finish_action(&self, id: &WorkerId, action: &ActionId, success: bool) -> Result<()> {
        let mut workers = self.workers.write();
        let info = workers.get_mut(id).ok_or_else(|| unknown_worker(id))?;
        info.in_progress.remove(action);
        if success {
            info.completed += 1;
        } else {
            info.failed += 1;
        }
        Ok(())
    }

    /// Remove and return a worker's in-progress assignments (recovery
    /// takes ownership so each action is reassigned exactly once).
    pub fn drain_in_progress(&self, id: &WorkerId) -> Vec<(ActionId, Priority)> {
        let mut workers = self.workers.write();
        match workers.get_mut(id) {
            Some(info) => info.in_progress.drain().collect(),
            None => Vec::new(),
        }
    }

    /// Demote every worker whose heartbeat is older than `timeout`;
    /// returns workers that just crossed into `Failed`.
    pub fn demote_stale(&self, timeout: std::time::Duration) -> Vec<WorkerId> {
        let mut newly_failed = Vec::new();
        let mut workers = self.workers.write();
        for info in workers.values_mut() {
            if info.health == WorkerHealth::Failed {
                continue;
            }
            if info.last_heartbeat.elapsed() > timeout {
                let next = info.health.demoted();
                if next != info.health {
                    tracing::warn!(worker = %info.id, from = ?info.health, to = ?next, "worker demoted");
                    info.health = next;
                    if next == WorkerHealth::Failed {
                        newly_failed.push(info.id);
                    }
                }
            }
        }
        newly_failed
    }
}

fn unknown_worker(id: &WorkerId) -> BuildError {
    BuildError::new(ErrorCode::NodeNotFound, format!("unknown worker {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mason_cache::ActionType;
    use std::time::Duration;

    fn action(tag: &str) -> ActionId {
        ActionId::new("//t:t", ActionType::Compile, tag, "ih")
    }

    #[test]
    fn test_register_heartbeat_promotes() {
        let registry = WorkerRegistry::new();
        let id = WorkerId::new();
        registry.register(id);
        assert_eq!(registry.get(&id).unwrap().health, WorkerHealth::Starting);

        registry.heartbeat(&id, 0.4).unwrap();
        let info = registry.get(&id).unwrap();
        assert_eq!(info.health, WorkerHealth::Healthy);
        assert!((info.load - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failed_worker_recovers_via_heartbeat() {
        let registry = WorkerRegistry::new();
        let id = WorkerId::new();
        registry.register(id);
        registry.set_health(&id, WorkerHealth::Failed).unwrap();
        registry.heartbeat(&id, 0.0).unwrap();
        assert_eq!(registry.get(&id).unwrap().health, WorkerHealth::Recovering);
    }

    #[test]
    fn test_action_bookkeeping() {
        let registry = WorkerRegistry::new();
        let id = WorkerId::new();
        registry.register(id);
        registry.claim_action(&id, action("a"), Priority::Normal).unwrap();
        registry.claim_action(&id, action("b"), Priority::High).unwrap();
        assert_eq!(registry.get(&id).unwrap().in_progress.len(), 2);

        registry.finish_action(&id, &action("a"), true).unwrap();
        let info = registry.get(&id).unwrap();
        assert_eq!(info.in_progress.len(), 1);
        assert_eq!(info.completed, 1);
        assert!((info.completion_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drain_takes_everything_once() {
        let registry = WorkerRegistry::new();
        let id = WorkerId::new();
        registry.register(id);
        registry.claim_action(&id, action("a"), Priority::Low).unwrap();
        registry.claim_action(&id, action("b"), Priority::Critical).unwrap();

        let drained = registry.drain_in_progress(&id);
        assert_eq!(drained.len(), 2);
        assert!(registry.drain_in_progress(&id).is_empty());
    }

    #[test]
    fn test_demotion_ladder() {
        let registry = WorkerRegistry::new();
        let id = WorkerId::new();
        registry.register(id);
        registry.heartbeat(&id, 0.0).unwrap();

        // Instant heartbeat, huge timeout: nothing demotes.
        assert!(registry.demote_stale(Duration::from_secs(3600)).is_empty());

        // Zero timeout: every check demotes one step.
        assert!(registry.demote_stale(Duration::ZERO).is_empty()); // Healthy -> Degraded
        assert!(registry.demote_stale(Duration::ZERO).is_empty()); // Degraded -> Failing
        let failed = registry.demote_stale(Duration::ZERO); // Failing -> Failed
        assert_eq!(failed, vec![id]);
        assert_eq!(registry.get(&id).unwrap().health, WorkerHealth::Failed);

        // Already failed: no further transitions reported.
        assert!(registry.demote_stale(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_unknown_worker_errors() {
        let registry = WorkerRegistry::new();
        assert!(registry.heartbeat(&WorkerId::new(), 0.0).is_err());
    }
}
