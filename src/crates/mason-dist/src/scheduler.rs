//! Action-to-worker assignment policies.

use crate::{WorkerId, WorkerInfo, WorkerRegistry};
use mason_error::{BuildError, ErrorCode, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How the coordinator picks a worker for a new action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    RoundRobin,
    #[default]
    LeastLoaded,
    /// Stick actions of one affinity key (e.g. language) to the worker
    /// that served it last, while it stays schedulable.
    Affinity,
    /// Score by health, free capacity and completion rate.
    Priority,
}

pub struct DistributedScheduler {
    registry: Arc<WorkerRegistry>,
    policy: SchedulingPolicy,
    round_robin: AtomicUsize,
    affinity: Mutex<HashMap<String, WorkerId>>,
}

impl DistributedScheduler {
    pub fn new(registry: Arc<WorkerRegistry>, policy: SchedulingPolicy) -> Self {
        Self {
            registry,
            policy,
            round_robin: AtomicUsize::new(0),
            affinity: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Pick a worker for an action.
    ///
    /// `affinity_key` feeds the affinity policy (ignored otherwise);
    /// `excluded` removes workers the caller knows are bad (blacklisted
    /// or just failed). Fails with `NoAvailableWorkers` when nothing
    /// schedulable remains.
    pub fn assign(
        &self,
        affinity_key: Option<&str>,
        excluded: &HashSet<WorkerId>,
    ) -> Result<WorkerId> {
        let mut candidates: Vec<WorkerInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|w| w.health.schedulable() && !excluded.contains(&w.id))
            .collect();
        if candidates.is_empty() {
            return Err(BuildError::new(
                ErrorCode::NoAvailableWorkers,
                "no schedulable workers",
            ));
        }
        // Deterministic base order so policies tie-break stably.
        candidates.sort_by_key(|w| w.id.to_string());

        let chosen = match self.policy {
            SchedulingPolicy::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                candidates[index % candidates.len()].id
            }
            SchedulingPolicy::LeastLoaded => {
                candidates
                    .iter()
                    .min_by(|a, b| {
                        a.load
                            .partial_cmp(&b.load)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("non-empty")
                    .id
            }
            SchedulingPolicy::Affinity => {
                let mut affinity = self.affinity.lock();
                match affinity_key {
                    Some(key) => {
                        let sticky = affinity
                            .get(key)
                            .copied()
                            .filter(|id| candidates.iter().any(|w| w.id == *id));
                        let chosen = sticky.unwrap_or_else(|| best_scored(&candidates));
                        affinity.insert(key.to_string(), chosen);
                        chosen
                    }
                    None => best_scored(&candidates),
                }
            }
            SchedulingPolicy::Priority => best_scored(&candidates),
        };
        Ok(chosen)
    }
}

/// `health bonus + 50·(1−load) + 50·completion_rate`.
pub(crate) fn worker_score(info: &WorkerInfo) -> f64 {
    info.health.score_bonus() + 50.0 * (1.0 - info.load) + 50.0 * info.completion_rate()
}

fn best_scored(candidates: &[WorkerInfo]) -> WorkerId {
    candidates
        .iter()
        .max_by(|a, b| {
            worker_score(a)
                .partial_cmp(&worker_score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("non-empty")
        .id
}
