//! Checkpoint & Resume
//!
//! The [`CheckpointManager`] snapshots graph progress to a versioned
//! binary file after every N completions and on shutdown; a clean build
//! termination discards it. The [`ResumePlanner`] validates a checkpoint
//! against the freshly constructed graph (same target set, same or
//! superset of edges, unchanged fingerprints for completed nodes) and
//! refuses with `StaleCheckpoint` on any drift. On success, completed
//! nodes are restored as done and everything else is rescheduled.

mod checkpoint;
mod manager;
mod resume;

pub use checkpoint::{workspace_digest, Checkpoint};
pub use manager::CheckpointManager;
pub use resume::{ResumePlan, ResumePlanner};
