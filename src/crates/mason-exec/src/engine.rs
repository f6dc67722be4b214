//! The execution engine: drives ready nodes through the cache and the
//! language handlers on the worker pool.
//!
//! Per node the flow is: claim (one CAS), fingerprint over sources and
//! dep fingerprints, cache lookup. A hit marks the node `Cached`; a
//! miss runs the language handler, persists artifacts into the CAS,
//! updates the target cache and re-evaluates dependents, which are
//! owner-pushed onto the completing worker's deque. A failure marks the
//! node `Failed` and cascades `Skipped` through its dependents without
//! touching sibling branches. The cancel flag is polled between deque
//! operations and before each handler invocation; partial outputs never
//! enter the cache.

use crate::handler::{BuildContext, DepArtifact, HandlerRegistry};
use crate::policy::{node_score, Priority};
use crate::pool::{WorkerContext, WorkerPool};
use mason_cache::{
    ActionCacheEntry, ActionId, ActionType, ArtifactMetadata, CacheCoordinator, Fingerprint,
    FingerprintBuilder, LookupOutcome, TargetCacheEntry,
};
use mason_error::{BuildError, ErrorCode, Result, ResultExt};
use mason_events::{BuildEvent, EventBus};
use mason_graph::{BuildGraph, BuildNode, NodeStatus, Target, TargetId};
use mason_sandbox::{DeterminismSpec, ResourceLimits, SandboxRunner, SandboxSpec};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine-wide knobs; per-target isolation derives from these defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    /// 0 = one worker per logical CPU.
    pub workers: usize,
    /// Completions between checkpoint-hook calls; 0 disables.
    pub checkpoint_interval: usize,
    pub resources: ResourceLimits,
    pub determinism: DeterminismSpec,
    /// Route external submissions through the priority queue.
    pub use_priorities: bool,
}

impl EngineConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            workers: 0,
            checkpoint_interval: 10,
            resources: ResourceLimits::default(),
            determinism: DeterminismSpec::default(),
            use_priorities: false,
        }
    }
}

/// One failed target in the report.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub target: TargetId,
    pub code: u16,
    pub message: String,
}

/// Outcome of one engine run.
#[derive(Debug)]
pub struct ExecutionReport {
    pub statuses: HashMap<TargetId, NodeStatus>,
    pub built: usize,
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
    pub handler_invocations: usize,
    pub duration: Duration,
    pub failures: Vec<FailureRecord>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

type CheckpointHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

struct Progress {
    completed: AtomicUsize,
    total: usize,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Progress {
    fn record(&self, n: usize) -> usize {
        let completed = self.completed.fetch_add(n, Ordering::AcqRel) + n;
        let _guard = self.mutex.lock();
        self.cond.notify_all();
        completed
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}

struct EngineShared {
    graph: Arc<BuildGraph>,
    cache: Arc<CacheCoordinator>,
    sandbox: Arc<SandboxRunner>,
    handlers: Arc<HandlerRegistry>,
    bus: EventBus,
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
    scope: HashSet<TargetId>,
    progress: Progress,
    invocations: AtomicUsize,
    failures: Mutex<Vec<FailureRecord>>,
    checkpoint_hook: Option<CheckpointHook>,
}

/// What `build_one` resolved to.
enum BuildStep {
    Finished(NodeStatus),
    Cancelled,
}

pub struct ExecutionEngine {
    graph: Arc<BuildGraph>,
    cache: Arc<CacheCoordinator>,
    sandbox: Arc<SandboxRunner>,
    handlers: Arc<HandlerRegistry>,
    bus: EventBus,
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
    checkpoint_hook: Option<CheckpointHook>,
}

impl ExecutionEngine {
    pub fn new(
        graph: Arc<BuildGraph>,
        cache: Arc<CacheCoordinator>,
        sandbox: Arc<SandboxRunner>,
        handlers: Arc<HandlerRegistry>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph,
            cache,
            sandbox,
            handlers,
            bus,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            checkpoint_hook: None,
        }
    }

    /// Install the periodic checkpoint callback; receives (completed,
    /// total).
    pub fn set_checkpoint_hook(&mut self, hook: CheckpointHook) {
        self.checkpoint_hook = Some(hook);
    }

    /// Shared cancel flag; setting it stops the build at the next poll
    /// point.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Build the whole graph, or `scope` plus its transitive deps.
    pub fn execute(&self, scope: Option<&TargetId>) -> Result<ExecutionReport> {
        let started = Instant::now();
        let scope_set: HashSet<TargetId> = match scope {
            Some(id) => self.graph.reachable_from(id)?,
            None => self.graph.nodes().map(|n| n.id().clone()).collect(),
        };
        // Nodes already terminal (restored by a resume plan) are part of
        // the scope but not of this run's work or counters.
        let preexisting: HashSet<TargetId> = scope_set
            .iter()
            .filter(|id| {
                self.graph
                    .node(id)
                    .map(|n| n.status().is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let total = scope_set.len() - preexisting.len();

        let shared = Arc::new(EngineShared {
            graph: self.graph.clone(),
            cache: self.cache.clone(),
            sandbox: self.sandbox.clone(),
            handlers: self.handlers.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            scope: scope_set.clone(),
            progress: Progress {
                completed: AtomicUsize::new(0),
                total,
                mutex: Mutex::new(()),
                cond: Condvar::new(),
            },
            invocations: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            checkpoint_hook: self.checkpoint_hook.clone(),
        });

        if total > 0 {
            self.run_pool(&shared)?;
        }

        if self.cancel.load(Ordering::Acquire) {
            return Err(BuildError::new(
                ErrorCode::BuildCancelled,
                "build cancelled",
            ));
        }

        Ok(self.report(&shared, &scope_set, &preexisting, started.elapsed()))
    }

    fn run_pool(&self, shared: &Arc<EngineShared>) -> Result<()> {
        let mut pool: WorkerPool<TargetId> =
            WorkerPool::new(self.config.workers, self.cancel.clone());
        {
            let shared = shared.clone();
            pool.start(move |task, ctx| process_node(&shared, &task, ctx));
        }

        // Seed with the ready frontier, most valuable first.
        let costs = self.graph.critical_path_costs()?;
        let mut ready: Vec<&BuildNode> = self
            .graph
            .ready_nodes()
            .into_iter()
            .filter(|n| shared.scope.contains(n.id()))
            .collect();
        ready.sort_by_key(|n| {
            std::cmp::Reverse(node_score(
                n,
                Priority::Normal,
                costs.get(n.id()).copied().unwrap_or(1),
            ))
        });
        for node in ready {
            if self.config.use_priorities {
                pool.submit(Priority::Normal, node.id().clone());
            } else {
                pool.submit_least_loaded(node.id().clone());
            }
        }

        // Wait for the run to finish or be cancelled.
        {
            let mut guard = shared.progress.mutex.lock();
            while shared.progress.completed() < shared.progress.total
                && !self.cancel.load(Ordering::Acquire)
            {
                shared
                    .progress
                    .cond
                    .wait_for(&mut guard, Duration::from_millis(50));
            }
        }

        pool.shutdown();
        Ok(())
    }

    fn report(
        &self,
        shared: &EngineShared,
        scope: &HashSet<TargetId>,
        preexisting: &HashSet<TargetId>,
        duration: Duration,
    ) -> ExecutionReport {
        let mut statuses = HashMap::with_capacity(scope.len());
        let (mut built, mut cached, mut failed, mut skipped) = (0, 0, 0, 0);
        for id in scope {
            if let Some(node) = self.graph.node(id) {
                let status = node.status();
                if !preexisting.contains(id) {
                    match status {
                        NodeStatus::Success => built += 1,
                        NodeStatus::Cached => cached += 1,
                        NodeStatus::Failed => failed += 1,
                        NodeStatus::Skipped => skipped += 1,
                        _ => {}
                    }
                }
                statuses.insert(id.clone(), status);
            }
        }
        ExecutionReport {
            statuses,
            built,
            cached,
            failed,
            skipped,
            handler_invocations: shared.invocations.load(Ordering::Acquire),
            duration,
            failures: shared.failures.lock().clone(),
        }
    }
}

/// Worker entry point for one node.
fn process_node(shared: &Arc<EngineShared>, id: &TargetId, ctx: &WorkerContext<'_, TargetId>) {
    if shared.cancel.load(Ordering::Acquire) {
        return;
    }
    let Some(node) = shared.graph.node(id) else {
        return;
    };
    // Exactly one worker wins the claim; duplicate submissions land here
    // and bail.
    if !node.begin_analysis() {
        return;
    }

    let completions = match build_one(shared, node, id) {
        Ok(BuildStep::Cancelled) => return,
        Ok(BuildStep::Finished(_)) => {
            enqueue_ready_dependents(shared, node, ctx);
            1
        }
        Err(err) => fail_node(shared, id, err),
    };

    let completed = shared.progress.record(completions);
    if let Some(hook) = &shared.checkpoint_hook {
        let interval = shared.config.checkpoint_interval;
        if interval > 0 && completed % interval == 0 {
            hook(completed, shared.progress.total);
        }
    }
}

/// Fingerprint, cache lookup, and (on miss) the sandboxed handler run.
fn build_one(shared: &Arc<EngineShared>, node: &BuildNode, id: &TargetId) -> Result<BuildStep> {
    let target = node.target().clone();
    let sources = load_sources(&shared.config.workspace_root, &target)
        .with_context("load_sources", || id.clone())?;

    // Dependency fingerprints exist by readiness; a gap is a scheduler
    // bug.
    let mut dep_fingerprints = Vec::with_capacity(node.deps().len());
    let mut dep_artifacts = Vec::new();
    for dep_id in node.deps() {
        let dep = shared.graph.node_checked(dep_id)?;
        let fingerprint = dep.fingerprint().ok_or_else(|| {
            BuildError::internal(format!("dependency {dep_id} completed without a fingerprint"))
        })?;
        let fingerprint = Fingerprint::from_hex(fingerprint);
        if let Some(entry) = shared.cache.peek(&fingerprint) {
            dep_artifacts.push(DepArtifact {
                target: dep_id.clone(),
                output_hash: entry.output_hash.clone(),
                metadata: entry.metadata.clone(),
            });
        }
        dep_fingerprints.push((dep_id.to_string(), fingerprint));
    }

    let fingerprint = FingerprintBuilder::for_target(&target, &sources, &dep_fingerprints);
    node.set_fingerprint(fingerprint.as_str());

    let claim = loop {
        match shared.cache.lookup_or_claim(id, &fingerprint) {
            LookupOutcome::Hit { entry, .. } | LookupOutcome::Shared(Some(entry)) => {
                node.set_output_hash(&entry.output_hash);
                node.transition(NodeStatus::Cached)?;
                return Ok(BuildStep::Finished(NodeStatus::Cached));
            }
            LookupOutcome::Build(claim) => break claim,
            // The concurrent owner failed; claim it ourselves.
            LookupOutcome::Shared(None) => continue,
        }
    };

    // Poll the cancel flag once more before committing to a handler run.
    if shared.cancel.load(Ordering::Acquire) {
        drop(claim);
        return Ok(BuildStep::Cancelled);
    }

    node.transition(NodeStatus::Ready)?;
    node.transition(NodeStatus::Running)?;
    shared.bus.publish(BuildEvent::TargetStarted {
        target: id.to_string(),
    });
    shared.invocations.fetch_add(1, Ordering::AcqRel);

    let handler = match shared.handlers.get(&target.language) {
        Ok(handler) => handler,
        Err(err) => {
            shared.cache.complete_claim(claim, None, Vec::new());
            return Err(err);
        }
    };

    let sandbox_spec = sandbox_spec_for(&shared.config, &target, &sources);
    let build_ctx = BuildContext {
        target: &target,
        workspace_root: &shared.config.workspace_root,
        sources: &sources,
        deps: &dep_artifacts,
        sandbox: &shared.sandbox,
        sandbox_spec: &sandbox_spec,
    };

    let run_started = Instant::now();
    let action = ActionId::new(
        id.clone(),
        ActionType::Compile,
        "build",
        fingerprint.as_str(),
    );
    // A panicking handler must fail its node, not take the worker down.
    let built = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler.build(&build_ctx)
    }))
    .unwrap_or_else(|_| {
        Err(BuildError::new(
            ErrorCode::ProcessCrashed,
            format!("handler for '{}' panicked", target.language),
        ))
    });

    match built {
        Ok(output) => {
            let duration_ms = run_started.elapsed().as_millis() as u64;
            let mut blobs = Vec::with_capacity(output.artifacts.len());
            let mut artifact_hashes = Vec::with_capacity(output.artifacts.len());
            let mut total_size = 0u64;
            for artifact in &output.artifacts {
                let hash = shared.cache.store().put(&artifact.bytes)?;
                total_size += artifact.bytes.len() as u64;
                blobs.push((hash.clone(), artifact.bytes.clone()));
                artifact_hashes.push(hash);
            }
            let output_hash =
                Fingerprint::of_bytes(artifact_hashes.join("\n").as_bytes()).to_string();

            let entry = TargetCacheEntry {
                fingerprint: fingerprint.clone(),
                output_hash: output_hash.clone(),
                metadata: ArtifactMetadata {
                    content_hash: artifact_hashes.first().cloned().unwrap_or_else(|| output_hash.clone()),
                    size: total_size,
                    compressed_size: total_size,
                    timestamp: chrono::Utc::now(),
                    workspace_tag: id.to_string(),
                    compressed: false,
                },
            };
            shared.cache.complete_claim(claim, Some(entry), blobs);
            shared.cache.action_record(ActionCacheEntry {
                action,
                input_hashes: vec![fingerprint.to_string()],
                output_hashes: artifact_hashes,
                metadata: Default::default(),
                success: true,
                timestamp: chrono::Utc::now(),
                attempts: 0,
            });

            node.set_output_hash(&output_hash);
            node.record_duration_ms(duration_ms);
            node.transition(NodeStatus::Success)?;
            shared.bus.publish(BuildEvent::TargetCompleted {
                target: id.to_string(),
                duration_ms,
            });
            Ok(BuildStep::Finished(NodeStatus::Success))
        }
        Err(err) => {
            // Failures are cached in the action tier only; the claim
            // resolves to a miss for any waiter.
            let mut metadata = std::collections::BTreeMap::new();
            metadata.insert("error".to_string(), err.to_string());
            shared.cache.action_record_failure(&action, metadata);
            shared.cache.complete_claim(claim, None, Vec::new());
            Err(err)
        }
    }
}

/// Mark the node failed, cascade skips, emit events; returns how many
/// nodes reached a terminal state.
fn fail_node(shared: &Arc<EngineShared>, id: &TargetId, err: BuildError) -> usize {
    tracing::error!(target = %id, error = %err, "target failed");
    shared.bus.publish(BuildEvent::TargetFailed {
        target: id.to_string(),
        error_code: err.code().code(),
        message: err.message().to_string(),
    });
    shared.failures.lock().push(FailureRecord {
        target: id.clone(),
        code: err.code().code(),
        message: err.render(),
    });

    let skipped = match shared.graph.mark_failed(id) {
        Ok(skipped) => skipped,
        Err(cascade_err) => {
            tracing::error!(target = %id, error = %cascade_err, "skip cascade failed");
            Vec::new()
        }
    };
    for skipped_id in &skipped {
        shared.bus.publish(BuildEvent::TargetSkipped {
            target: skipped_id.to_string(),
            failed_ancestor: id.to_string(),
        });
    }
    1 + skipped.len()
}

/// Owner-push newly ready dependents onto this worker's deque.
fn enqueue_ready_dependents(
    shared: &Arc<EngineShared>,
    node: &BuildNode,
    ctx: &WorkerContext<'_, TargetId>,
) {
    for dependent_id in node.dependents() {
        if !shared.scope.contains(dependent_id) {
            continue;
        }
        let Some(dependent) = shared.graph.node(dependent_id) else {
            continue;
        };
        if dependent.status() != NodeStatus::Pending {
            continue;
        }
        let ready = dependent.deps().iter().all(|dep| {
            shared
                .graph
                .node(dep)
                .map(|n| n.status().satisfies_dependents())
                .unwrap_or(false)
        });
        if ready {
            ctx.submit_local(dependent_id.clone());
        }
    }
}

fn load_sources(workspace_root: &std::path::Path, target: &Target) -> Result<Vec<(String, Vec<u8>)>> {
    let mut sources = Vec::with_capacity(target.sources.len());
    for path in &target.sources {
        let absolute = workspace_root.join(path);
        let contents = std::fs::read(&absolute)
            .map_err(BuildError::from)
            .with_context("read_source", || absolute.display().to_string())?;
        sources.push((path.display().to_string(), contents));
    }
    Ok(sources)
}

fn sandbox_spec_for(
    config: &EngineConfig,
    target: &Target,
    sources: &[(String, Vec<u8>)],
) -> SandboxSpec {
    let inputs = sources
        .iter()
        .map(|(path, _)| config.workspace_root.join(path))
        .collect();
    let outputs = match &target.output_path {
        Some(path) => vec![config.workspace_root.join(path)],
        None => vec![config
            .workspace_root
            .join("out")
            .join(target.id.as_str().replace(['/', ':'], "_"))],
    };
    SandboxSpec::new()
        .with_inputs(inputs)
        .with_outputs(outputs)
        .with_resources(config.resources)
        .with_determinism(config.determinism.clone())
}
