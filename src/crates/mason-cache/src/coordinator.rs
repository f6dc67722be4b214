//! The multi-tier cache coordinator.
//!
//! Ties the tiers together behind one façade for the execution engine:
//! local target cache first, then the remote tier, with the action cache
//! and CAS available to handlers. Guarantees at most one concurrent build
//! per fingerprint via an in-process claim map, atomic local updates, and
//! detached remote pushes that never block the foreground path.

use crate::{
    ActionCache, ActionCacheEntry, ActionId, CasStats, ContentStore, Fingerprint,
    GarbageCollector, GcStats, RemoteCacheClient, TargetCache, TargetCacheEntry,
};
use dashmap::DashMap;
use mason_error::Result;
use mason_events::{BuildEvent, EventBus};
use mason_graph::TargetId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Running counters across all tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub updates: u64,
    pub action_hits: u64,
    pub action_misses: u64,
    pub pushes_ok: u64,
    pub pushes_failed: u64,
}

#[derive(Debug, Default)]
struct InFlightSlot {
    /// `None` until the owner completes; then `Some(build outcome)`.
    result: Mutex<Option<Option<TargetCacheEntry>>>,
    cond: Condvar,
}

impl InFlightSlot {
    fn wait(&self) -> Option<TargetCacheEntry> {
        let mut guard = self.result.lock();
        while guard.is_none() {
            self.cond.wait(&mut guard);
        }
        guard.as_ref().expect("loop exits on Some").clone()
    }

    fn finish(&self, outcome: Option<TargetCacheEntry>) {
        *self.result.lock() = Some(outcome);
        self.cond.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.result.lock().is_some()
    }
}

/// Exclusive right to build one fingerprint. Complete it via
/// [`CacheCoordinator::complete_claim`]; dropping it un-completed
/// releases waiters with a miss so nobody deadlocks on a panicked
/// builder.
#[derive(Debug)]
pub struct FingerprintClaim {
    fingerprint: Fingerprint,
    slot: Arc<InFlightSlot>,
    completed: bool,
}

impl Drop for FingerprintClaim {
    fn drop(&mut self) {
        if !self.completed {
            self.slot.finish(None);
        }
    }
}

/// Result of [`CacheCoordinator::lookup_or_claim`].
#[derive(Debug)]
pub enum LookupOutcome {
    /// A tier already holds the artifact.
    Hit {
        entry: TargetCacheEntry,
        remote: bool,
    },
    /// Caller owns the build for this fingerprint.
    Build(FingerprintClaim),
    /// Another in-flight build owned the fingerprint; this is its
    /// outcome (`None` when that build failed).
    Shared(Option<TargetCacheEntry>),
}

#[derive(Debug)]
pub struct CacheCoordinator {
    targets: TargetCache,
    actions: ActionCache,
    store: ContentStore,
    remote: Option<Arc<RemoteCacheClient>>,
    runtime: Option<tokio::runtime::Handle>,
    in_flight: DashMap<Fingerprint, Arc<InFlightSlot>>,
    bus: EventBus,
    stats: Arc<Mutex<CacheStats>>,
    cache_dir: PathBuf,
}

impl CacheCoordinator {
    /// Open all local tiers under `cache_dir`.
    pub fn open(cache_dir: impl Into<PathBuf>, bus: EventBus) -> Result<Self> {
        let cache_dir = cache_dir.into();
        Ok(Self {
            targets: TargetCache::open(&cache_dir),
            actions: ActionCache::open(&cache_dir),
            store: ContentStore::open(&cache_dir)?,
            remote: None,
            runtime: None,
            in_flight: DashMap::new(),
            bus,
            stats: Arc::new(Mutex::new(CacheStats::default())),
            cache_dir,
        })
    }

    /// Attach the remote tier. `runtime` hosts the detached push tasks
    /// and the blocking remote reads.
    pub fn with_remote(
        mut self,
        client: RemoteCacheClient,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        self.remote = Some(Arc::new(client));
        self.runtime = Some(runtime);
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn cas_stats(&self) -> CasStats {
        self.store.stats()
    }

    /// Silent target-tier read: no events, no stats, no claim. Used to
    /// resolve dependency artifacts that are known to be cached.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<TargetCacheEntry> {
        self.targets.get(fingerprint)
    }

    /// Tiered lookup plus build-claim arbitration.
    ///
    /// Exactly one caller per fingerprint gets `Build`; racing callers
    /// block until the owner completes and then observe its outcome.
    pub fn lookup_or_claim(&self, target: &TargetId, fingerprint: &Fingerprint) -> LookupOutcome {
        if let Some(entry) = self.lookup_local(target, fingerprint) {
            return LookupOutcome::Hit {
                entry,
                remote: false,
            };
        }

        // Arbitrate before the remote round-trip so concurrent misses
        // don't both fetch.
        let slot = Arc::new(InFlightSlot::default());
        let claim = {
            use dashmap::mapref::entry::Entry;
            match self.in_flight.entry(fingerprint.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(slot.clone());
                    Some(FingerprintClaim {
                        fingerprint: fingerprint.clone(),
                        slot,
                        completed: false,
                    })
                }
                Entry::Occupied(mut occupied) => {
                    if occupied.get().is_finished() {
                        // Abandoned claim from a panicked builder; take over.
                        occupied.insert(slot.clone());
                        Some(FingerprintClaim {
                            fingerprint: fingerprint.clone(),
                            slot,
                            completed: false,
                        })
                    } else {
                        let existing = occupied.get().clone();
                        drop(occupied);
                        let outcome = existing.wait();
                        return LookupOutcome::Shared(outcome);
                    }
                }
            }
        };
        let mut claim = claim.expect("claim assigned in both arms");

        if let Some(entry) = self.lookup_remote(target, fingerprint) {
            // Local tier was already populated by the remote lookup;
            // just release the claim.
            claim.completed = true;
            self.in_flight.remove(&claim.fingerprint);
            claim.slot.finish(Some(entry.clone()));
            return LookupOutcome::Hit {
                entry,
                remote: true,
            };
        }

        {
            let mut stats = self.stats.lock();
            stats.misses += 1;
        }
        self.bus.publish(BuildEvent::CacheMiss {
            target: target.to_string(),
            fingerprint: fingerprint.to_string(),
        });
        LookupOutcome::Build(claim)
    }

    /// Record the build outcome for a claimed fingerprint and wake every
    /// waiter. `Some(entry)` also performs the local update and pushes
    /// `blobs` to the remote tier.
    pub fn complete_claim(
        &self,
        mut claim: FingerprintClaim,
        outcome: Option<TargetCacheEntry>,
        blobs: Vec<(String, Vec<u8>)>,
    ) {
        if let Some(entry) = &outcome {
            self.update(entry.clone(), blobs);
        }
        claim.completed = true;
        self.in_flight.remove(&claim.fingerprint);
        claim.slot.finish(outcome);
    }

    fn lookup_local(&self, target: &TargetId, fingerprint: &Fingerprint) -> Option<TargetCacheEntry> {
        let entry = self.targets.get(fingerprint)?;
        let mut stats = self.stats.lock();
        stats.local_hits += 1;
        drop(stats);
        self.bus.publish(BuildEvent::CacheHit {
            target: target.to_string(),
            remote: false,
        });
        Some(entry)
    }

    fn lookup_remote(&self, target: &TargetId, fingerprint: &Fingerprint) -> Option<TargetCacheEntry> {
        let client = self.remote.as_ref()?;
        let runtime = self.runtime.as_ref()?;
        match runtime.block_on(client.get_metadata(fingerprint)) {
            Ok(Some(entry)) => {
                // Populate local so the next lookup short-circuits.
                self.targets.insert(entry.clone());
                let mut stats = self.stats.lock();
                stats.remote_hits += 1;
                drop(stats);
                self.bus.publish(BuildEvent::CacheHit {
                    target: target.to_string(),
                    remote: true,
                });
                Some(entry)
            }
            Ok(None) => None,
            Err(err) => {
                // Remote trouble downgrades to a miss.
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %err,
                    "remote cache lookup failed"
                );
                None
            }
        }
    }

    /// Atomic local update plus detached remote push.
    pub fn update(&self, entry: TargetCacheEntry, blobs: Vec<(String, Vec<u8>)>) {
        let fingerprint = entry.fingerprint.clone();
        self.targets.insert(entry.clone());
        {
            let mut stats = self.stats.lock();
            stats.updates += 1;
        }
        self.bus.publish(BuildEvent::CacheUpdate {
            target: entry.metadata.workspace_tag.clone(),
            fingerprint: fingerprint.to_string(),
        });

        if let (Some(client), Some(runtime)) = (&self.remote, &self.runtime) {
            let client = client.clone();
            let bus = self.bus.clone();
            let stats = self.stats.clone();
            runtime.spawn(async move {
                let ok = client.push_with_retry(&entry, &blobs).await.is_ok();
                {
                    let mut stats = stats.lock();
                    if ok {
                        stats.pushes_ok += 1;
                    } else {
                        stats.pushes_failed += 1;
                    }
                }
                if !ok {
                    tracing::warn!(fingerprint = %fingerprint, "remote cache push failed");
                }
                bus.publish(BuildEvent::RemotePush {
                    fingerprint: fingerprint.to_string(),
                    ok,
                });
            });
        }
    }

    /// Action-tier lookup, counting and emitting hit/miss events.
    pub fn action_lookup(
        &self,
        id: &ActionId,
        recomputed_input_hash: &str,
    ) -> Option<ActionCacheEntry> {
        let found = self.actions.get(id, recomputed_input_hash);
        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.action_hits += 1;
            drop(stats);
            self.bus.publish(BuildEvent::ActionHit {
                target: id.target.to_string(),
                action: id.to_string(),
            });
        } else {
            stats.action_misses += 1;
            drop(stats);
            self.bus.publish(BuildEvent::ActionMiss {
                target: id.target.to_string(),
                action: id.to_string(),
            });
        }
        found
    }

    pub fn action_record(&self, entry: ActionCacheEntry) {
        self.actions.insert(entry);
    }

    /// Failures live in the action tier only, never the target tier.
    pub fn action_record_failure(&self, id: &ActionId, metadata: BTreeMap<String, String>) {
        self.actions.record_failure(id, metadata);
    }

    /// Persist both index files.
    pub fn flush(&self) -> Result<()> {
        self.targets.flush()?;
        self.actions.flush()?;
        Ok(())
    }

    /// Drop all local cache state (the `clean` operation).
    pub fn clear(&self) {
        self.targets.clear();
        self.actions.clear();
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Run a mark-sweep pass over the CAS.
    pub fn collect_garbage(&self, retention: Duration) -> Result<GcStats> {
        GarbageCollector::new(retention).collect(&self.store, &self.targets, &self.actions, &[])
    }
}
