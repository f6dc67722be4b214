//! Failure response on the coordinator: reassignment and blacklisting.

use crate::scheduler::DistributedScheduler;
use crate::{WorkerHealth, WorkerId, WorkerRegistry};
use mason_cache::ActionId;
use mason_error::Result;
use mason_events::{BuildEvent, EventBus};
use mason_exec::Priority;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIRST_FAILURE_BLACKLIST: Duration = Duration::from_secs(5);
const MAX_BLACKLIST: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct BlacklistEntry {
    failures: u32,
    until: Instant,
}

/// Exponential-backoff blacklist: 5s on the first failure, then
/// `2^failures` seconds capped at 300s. A success clears the entry.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: Mutex<HashMap<WorkerId, BlacklistEntry>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; returns how long the worker is banned.
    pub fn record_failure(&self, id: WorkerId) -> Duration {
        let mut entries = self.entries.lock();
        let failures = entries.get(&id).map(|e| e.failures + 1).unwrap_or(1);
        let duration = Self::duration_for(failures);
        entries.insert(
            id,
            BlacklistEntry {
                failures,
                until: Instant::now() + duration,
            },
        );
        tracing::warn!(worker = %id, failures, banned_secs = duration.as_secs(), "worker blacklisted");
        duration
    }

    pub fn duration_for(failures: u32) -> Duration {
        if failures <= 1 {
            FIRST_FAILURE_BLACKLIST
        } else {
            let secs = 2u64.saturating_pow(failures.min(32));
            Duration::from_secs(secs).min(MAX_BLACKLIST)
        }
    }

    pub fn is_blacklisted(&self, id: &WorkerId) -> bool {
        self.entries
            .lock()
            .get(id)
            .map(|e| e.until > Instant::now())
            .unwrap_or(false)
    }

    /// A successful retry removes the worker from the blacklist.
    pub fn clear(&self, id: &WorkerId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn blacklisted(&self) -> Vec<WorkerId> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.until > now)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn failures_of(&self, id: &WorkerId) -> u32 {
        self.entries.lock().get(id).map(|e| e.failures).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub successful_reassignments: u64,
    pub failed_reassignments: u64,
    pub workers_failed: u64,
    pub workers_recovered: u64,
}

/// Reacts to worker failure: drains the dead worker's in-progress
/// actions and reassigns each exactly once, highest priority first.
pub struct CoordinatorRecovery {
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<DistributedScheduler>,
    blacklist: Arc<Blacklist>,
    bus: EventBus,
    stats: Mutex<RecoveryStats>,
}

impl CoordinatorRecovery {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<DistributedScheduler>,
        blacklist: Arc<Blacklist>,
        bus: EventBus,
    ) -> Self {
        Self {
            registry,
            scheduler,
            blacklist,
            bus,
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        *self.stats.lock()
    }

    /// Handle one worker failure end to end. Returns the reassignments
    /// made; actions that found no home are reported in the stats and
    /// left for the caller to requeue.
    pub fn handle_worker_failure(&self, failed: WorkerId) -> Result<Vec<(ActionId, WorkerId)>> {
        self.registry.set_health(&failed, WorkerHealth::Failed)?;
        self.blacklist.record_failure(failed);

        // Taking the set out of the registry makes reassignment
        // exactly-once: nobody else can observe these as in-progress.
        let mut orphaned = self.registry.drain_in_progress(&failed);
        {
            let mut stats = self.stats.lock();
            stats.workers_failed += 1;
        }
        self.bus.publish(BuildEvent::WorkerFailed {
            worker: failed.to_string(),
            in_progress: orphaned.len(),
        });

        // Highest priority first, stable within a level.
        orphaned.sort_by_key(|(action, priority)| {
            (std::cmp::Reverse(*priority), action.to_string())
        });

        let mut excluded: HashSet<WorkerId> = [failed].into_iter().collect();
        excluded.extend(self.blacklist.blacklisted());

        let mut reassigned = Vec::with_capacity(orphaned.len());
        for (action, priority) in orphaned {
            match self.scheduler.assign(None, &excluded) {
                Ok(new_worker) => {
                    self.registry
                        .claim_action(&new_worker, action.clone(), priority)?;
                    self.bus.publish(BuildEvent::Reassignment {
                        action: action.to_string(),
                        from_worker: failed.to_string(),
                        to_worker: new_worker.to_string(),
                    });
                    self.stats.lock().successful_reassignments += 1;
                    reassigned.push((action, new_worker));
                }
                Err(err) => {
                    tracing::error!(action = %action, error = %err, "reassignment failed");
                    self.stats.lock().failed_reassignments += 1;
                }
            }
        }
        Ok(reassigned)
    }

    /// A worker proved itself again: clear its blacklist entry.
    pub fn record_worker_success(&self, id: &WorkerId) {
        if self.blacklist.clear(id) {
            self.stats.lock().workers_recovered += 1;
            tracing::info!(worker = %id, "worker removed from blacklist");
        }
    }
}
