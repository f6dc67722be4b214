//! Distributed coordinator and worker registry
//!
//! For multi-host builds the coordinator process owns the worker
//! registry, assigns actions by policy, watches heartbeats, and recovers
//! from worker failures: in-progress actions are reassigned exactly once
//! each, the dead worker is blacklisted on an exponential ladder, and a
//! later success clears the entry. The worker side mirrors the
//! structure with peer-connection health tracking and a per-priority
//! retry orchestrator. The wire layer exposes the remote-cache and
//! worker-channel endpoints over HTTP with a keyed-hash workspace token.
//!
//! The coordinator is authoritative, not replicated; there is no
//! consensus layer.

mod health;
mod peer;
mod provision;
mod recovery;
mod retry;
mod scheduler;
mod wire;
mod worker;

pub use health::HealthMonitor;
pub use peer::{FailureKind, PeerHealth, WorkerRecovery};
pub use provision::{Autoscaler, ScaleDecision, WorkerProvisioner};
pub use recovery::{Blacklist, CoordinatorRecovery, RecoveryStats};
pub use retry::{RetryOrchestrator, RetryPolicy};
pub use scheduler::{DistributedScheduler, SchedulingPolicy};
pub use wire::{
    wire_router, ActionRequest, ActionResult, Heartbeat, WireState, WorkerFrame,
};
pub use worker::{WorkerHealth, WorkerId, WorkerInfo, WorkerRegistry};
