//! Scheduling policies layered above the worker pool.
//!
//! Dependents of a just-finished task go to the completing worker's own
//! deque (owner-push, locality). External submissions either pick the
//! least-loaded worker or, when priorities are enabled, flow through a
//! multi-level queue drained highest level first.

use mason_graph::BuildNode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Task priority levels. Order matters: `Critical` outranks everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const LEVELS: usize = 4;

    pub fn level(self) -> usize {
        self as usize
    }

    fn from_level(level: usize) -> Self {
        match level {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

/// Dynamic priority score:
/// `1000·priority + 100·critical_path_cost + 10·dependents − depth`.
///
/// Critical-path cost dominates among equal priorities so long chains
/// start early; depth is a late tiebreak that prefers shallow nodes.
pub fn priority_score(
    priority: Priority,
    critical_path_cost: u64,
    dependents: usize,
    depth: usize,
) -> i64 {
    1000 * priority.level() as i64 + 100 * critical_path_cost as i64
        + 10 * dependents as i64
        - depth as i64
}

/// Score for a graph node given its precomputed critical-path cost.
pub fn node_score(node: &BuildNode, priority: Priority, critical_path_cost: u64) -> i64 {
    priority_score(
        priority,
        critical_path_cost,
        node.dependents().len(),
        node.depth(),
    )
}

/// One FIFO list per priority level; dequeue scans from the highest
/// level down.
#[derive(Debug)]
pub struct MultiLevelQueue<T> {
    levels: [Mutex<VecDeque<T>>; Priority::LEVELS],
}

impl<T> MultiLevelQueue<T> {
    pub fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, priority: Priority, value: T) {
        self.levels[priority.level()].lock().push_back(value);
    }

    /// Pop the oldest entry of the highest non-empty level.
    pub fn pop(&self) -> Option<(Priority, T)> {
        for level in (0..Priority::LEVELS).rev() {
            if let Some(value) = self.levels[level].lock().pop_front() {
                return Some((Priority::from_level(level), value));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|l| l.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|l| l.lock().is_empty())
    }
}

impl<T> Default for MultiLevelQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
