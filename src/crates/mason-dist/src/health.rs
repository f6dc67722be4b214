//! Heartbeat surveillance.
//!
//! Each check demotes workers whose heartbeat is older than the timeout
//! one step down the ladder; the step that lands on `Failed` hands the
//! worker to the recovery callback. Runs as a detached tokio interval
//! task so the build's critical path never waits on it.

use crate::{WorkerId, WorkerRegistry};
use std::sync::Arc;
use std::time::Duration;

pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    heartbeat_timeout: Duration,
    check_interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            heartbeat_timeout: Duration::from_secs(15),
            check_interval: Duration::from_secs(5),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// One surveillance pass; returns workers that just failed.
    pub fn check_once(&self) -> Vec<WorkerId> {
        self.registry.demote_stale(self.heartbeat_timeout)
    }

    /// Run surveillance until the returned handle is aborted. Newly
    /// failed workers are passed to `on_failed` (typically
    /// `CoordinatorRecovery::handle_worker_failure`).
    pub fn spawn<F>(self, on_failed: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(WorkerId) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for failed in self.check_once() {
                    on_failed(failed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerHealth;
    use parking_lot::Mutex;

    #[test]
    fn test_check_once_walks_the_ladder() {
        let registry = Arc::new(WorkerRegistry::new());
        let id = WorkerId::new();
        registry.register(id);
        registry.heartbeat(&id, 0.0).unwrap();

        let monitor =
            HealthMonitor::new(registry.clone()).with_heartbeat_timeout(Duration::ZERO);
        assert!(monitor.check_once().is_empty());
        assert_eq!(registry.get(&id).unwrap().health, WorkerHealth::Degraded);
        assert!(monitor.check_once().is_empty());
        assert_eq!(monitor.check_once(), vec![id]);
        assert_eq!(registry.get(&id).unwrap().health, WorkerHealth::Failed);
    }

    #[test]
    fn test_live_heartbeats_keep_workers_healthy() {
        let registry = Arc::new(WorkerRegistry::new());
        let id = WorkerId::new();
        registry.register(id);
        registry.heartbeat(&id, 0.2).unwrap();

        let monitor = HealthMonitor::new(registry.clone())
            .with_heartbeat_timeout(Duration::from_secs(60));
        assert!(monitor.check_once().is_empty());
        assert_eq!(registry.get(&id).unwrap().health, WorkerHealth::Healthy);
    }

    #[tokio::test]
    async fn test_spawned_monitor_reports_failures() {
        let registry = Arc::new(WorkerRegistry::new());
        let id = WorkerId::new();
        registry.register(id);
        registry.heartbeat(&id, 0.0).unwrap();

        let failed = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let failed = failed.clone();
            HealthMonitor::new(registry)
                .with_heartbeat_timeout(Duration::ZERO)
                .with_check_interval(Duration::from_millis(5))
                .spawn(move |id| failed.lock().push(id))
        };

        // Three demotion steps at 5ms cadence.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert_eq!(failed.lock().as_slice(), &[id]);
    }
}
