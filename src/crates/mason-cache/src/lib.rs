//! Multi-Tier Cache - target cache, action cache, CAS and the remote tier
//!
//! The cache coordinator answers one question for the execution engine:
//! "has this fingerprint been built before, and if so where is the
//! artifact?". Lookup walks the tiers in order, first hit wins:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  ExecutionEngine                                           │
//! │  • fingerprint query per ready node                        │
//! └─────────────┬─────────────────────────────────────────────┘
//!               ↓
//! ┌───────────────────────────────────────────────────────────┐
//! │  CacheCoordinator                                          │
//! │  1. TargetCache   fingerprint -> artifact metadata         │
//! │  2. ActionCache   action id   -> action entry              │
//! │  3. ContentStore  blob hash   -> bytes (backs 1 and 2)     │
//! │  4. RemoteCache   read on local miss, async push on update │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Each tier is protected by a single short-held mutex. Remote pushes run
//! on detached tasks and never block the foreground path; remote failures
//! are logged and otherwise invisible. Cache read failures downgrade to a
//! miss. The coordinator also guarantees at most one concurrent build per
//! fingerprint: concurrent lookups for the same fingerprint share one
//! in-flight claim.

mod action;
mod cas;
mod chunk;
mod codec;
mod coordinator;
mod fingerprint;
mod gc;
mod remote;
mod source_ref;
mod target_cache;

pub use action::{ActionCache, ActionCacheEntry, ActionId, ActionType};
pub use cas::{CasStats, ContentStore};
pub use chunk::{Chunk, ChunkManifest, Chunker};
pub use coordinator::{CacheCoordinator, CacheStats, FingerprintClaim, LookupOutcome};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use gc::{GarbageCollector, GcStats};
pub use remote::{workspace_token, Compression, RemoteCacheClient, RemoteCacheConfig, TOKEN_HEADER};
pub use source_ref::{SourceRef, SourceRefSet};
pub use target_cache::{ArtifactMetadata, TargetCache, TargetCacheEntry};
