//! Hermetic execution sandbox
//!
//! A [`SandboxSpec`] is a pure data value describing isolation: which
//! paths may be read and written, the exact environment, the network
//! policy, resource limits and determinism requirements. The
//! [`SandboxRunner`] enforces it through a pluggable
//! [`IsolationBackend`]; the portable backend scrubs the environment,
//! confines the process to a private scratch directory, enforces the
//! wall-clock limit in the runner and the remaining ceilings as child
//! rlimits (memory, cpu time, file size, process count), so containers
//! are never required. Each exceeded limit surfaces as its own error
//! kind. Platform backends (namespaces + cgroups, sandbox profiles, job
//! objects) slot in behind the same trait.

mod determinism;
mod runner;
mod spec;

pub use determinism::{scan_artifact, NondeterminismWarning};
pub use runner::{
    minimal_env, ExecutionResult, ExecutionStatus, IsolationBackend, LimitKind,
    PortableBackend, ResourceUsage, SandboxCommand, SandboxRunner,
};
pub use spec::{DeterminismSpec, NetworkPolicy, ResourceLimits, SandboxSpec};
