//! End-to-end recovery scenario: four workers, ten actions, one worker
//! dies holding two of them.

use mason_cache::{ActionId, ActionType};
use mason_dist::{
    Blacklist, CoordinatorRecovery, DistributedScheduler, HealthMonitor, SchedulingPolicy,
    WorkerId, WorkerRegistry,
};
use mason_events::EventBus;
use mason_exec::Priority;
use std::sync::Arc;
use std::time::Duration;

fn action(n: usize) -> ActionId {
    ActionId::new(
        format!("//t:{n}").as_str(),
        ActionType::Compile,
        "build",
        format!("ih-{n}"),
    )
}

#[test]
fn test_worker_failure_reassignment_scenario() {
    let registry = Arc::new(WorkerRegistry::new());
    let workers: Vec<WorkerId> = (0..4)
        .map(|_| {
            let id = WorkerId::new();
            registry.register(id);
            registry.heartbeat(&id, 0.0).unwrap();
            id
        })
        .collect();

    // Assign 10 actions round-robin; worker 0 holds actions 0, 4, 8.
    // We'll fail worker 1, which holds actions 1 and 5 (and 9).
    for n in 0..10 {
        let owner = workers[n % 4];
        registry
            .claim_action(&owner, action(n), Priority::Normal)
            .unwrap();
    }
    // Trim worker 1 down to exactly two in-progress actions.
    registry.finish_action(&workers[1], &action(9), true).unwrap();
    assert_eq!(registry.get(&workers[1]).unwrap().in_progress.len(), 2);

    let scheduler = Arc::new(DistributedScheduler::new(
        registry.clone(),
        SchedulingPolicy::LeastLoaded,
    ));
    let blacklist = Arc::new(Blacklist::new());
    let recovery = CoordinatorRecovery::new(
        registry.clone(),
        scheduler,
        blacklist.clone(),
        EventBus::new(),
    );

    // The health monitor notices the dead worker: three missed checks
    // walk it down the ladder while live heartbeats keep the survivors
    // healthy.
    let monitor =
        HealthMonitor::new(registry.clone()).with_heartbeat_timeout(Duration::from_millis(50));
    let mut failed = Vec::new();
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(60));
        for survivor in [workers[0], workers[2], workers[3]] {
            registry.heartbeat(&survivor, 0.2).unwrap();
        }
        failed.extend(monitor.check_once());
    }
    assert_eq!(failed, vec![workers[1]]);

    // ...and recovery reassigns both in-progress actions to survivors.
    let reassigned = recovery.handle_worker_failure(workers[1]).unwrap();
    assert_eq!(reassigned.len(), 2);
    assert_eq!(recovery.stats().successful_reassignments, 2);
    assert!(blacklist.is_blacklisted(&workers[1]));

    // Every orphaned action lives on exactly one surviving worker.
    for (reassigned_action, new_owner) in &reassigned {
        assert_ne!(*new_owner, workers[1]);
        let owners = workers
            .iter()
            .filter(|w| {
                registry
                    .get(w)
                    .unwrap()
                    .in_progress
                    .contains_key(reassigned_action)
            })
            .count();
        assert_eq!(owners, 1);
    }
    assert!(registry.get(&workers[1]).unwrap().in_progress.is_empty());

    // The worker comes back, heartbeats, succeeds, and is forgiven.
    registry.heartbeat(&workers[1], 0.0).unwrap();
    recovery.record_worker_success(&workers[1]);
    assert!(!blacklist.is_blacklisted(&workers[1]));
    assert_eq!(recovery.stats().workers_recovered, 1);
}
