//! The programmatic API surface.

use crate::{compute_fingerprints, BuildConfig};
use mason_cache::{CacheCoordinator, CacheStats, RemoteCacheClient};
use mason_checkpoint::{CheckpointManager, ResumePlanner};
use mason_error::{BuildError, ErrorCategory, ErrorCode, Result, ResultExt};
use mason_events::{BuildEvent, EventBus, Subscription, TelemetrySink};
use mason_exec::{
    EngineConfig, ExecutionEngine, ExecutionReport, FailureRecord, HandlerRegistry,
};
use mason_graph::{BuildGraph, GraphStats, NodeStatus, Target, TargetId};
use mason_sandbox::SandboxRunner;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a `build` or `resume` call hands back.
#[derive(Debug)]
pub struct BuildReport {
    pub targets: HashMap<TargetId, NodeStatus>,
    pub built: usize,
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
    pub handler_invocations: usize,
    pub duration: Duration,
    pub failures: Vec<FailureRecord>,
    pub cache_stats: CacheStats,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// The assembled build core. One instance per workspace.
pub struct Mason {
    config: BuildConfig,
    targets: Vec<Target>,
    bus: EventBus,
    cache: Arc<CacheCoordinator>,
    sandbox: Arc<SandboxRunner>,
    handlers: Arc<HandlerRegistry>,
    checkpoints: Arc<CheckpointManager>,
    telemetry: TelemetrySink,
    telemetry_sub: Mutex<Option<Subscription>>,
    /// Hosts detached tasks (remote pushes); present only when a remote
    /// tier is configured.
    _runtime: Option<tokio::runtime::Runtime>,
}

impl Mason {
    /// Wire every service. `targets` come from the workspace loader;
    /// `handlers` from the language integrations.
    pub fn new(
        config: BuildConfig,
        targets: Vec<Target>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        let bus = EventBus::new();
        let mut cache = CacheCoordinator::open(&config.cache_dir, bus.clone())
            .context("open_cache", config.cache_dir.display())?;

        let runtime = match &config.remote {
            Some(remote_config) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("mason-remote")
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        BuildError::new(ErrorCode::ThreadPoolError, e.to_string()).with_source(e)
                    })?;
                cache = cache.with_remote(
                    RemoteCacheClient::new(remote_config.clone()),
                    runtime.handle().clone(),
                );
                Some(runtime)
            }
            None => None,
        };

        let telemetry = TelemetrySink::new(&config.cache_dir, config.telemetry.clone());
        let telemetry_sub = telemetry.enabled().then(|| bus.subscribe());

        Ok(Self {
            sandbox: Arc::new(SandboxRunner::new(config.cache_dir.join("scratch"))),
            checkpoints: Arc::new(CheckpointManager::new(&config.workspace_root)),
            cache: Arc::new(cache),
            handlers: Arc::new(handlers),
            telemetry,
            telemetry_sub: Mutex::new(telemetry_sub),
            config,
            targets,
            bus,
            _runtime: runtime,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Build everything, or `target` plus its transitive dependencies.
    pub fn build(&self, target: Option<&TargetId>) -> Result<BuildReport> {
        let graph = Arc::new(BuildGraph::from_targets(self.targets.clone())?);
        self.run(graph, target)
    }

    /// Resume from the last checkpoint. Completed nodes are recognized
    /// without handler calls; a stale checkpoint is refused.
    pub fn resume(&self) -> Result<BuildReport> {
        let graph = Arc::new(BuildGraph::from_targets(self.targets.clone())?);
        match self.checkpoints.load()? {
            Some(checkpoint) => {
                let fingerprints = compute_fingerprints(&graph, &self.config.workspace_root)?;
                let planner = ResumePlanner::new();
                let plan = planner.plan(&checkpoint, &graph, &fingerprints)?;
                planner.apply(&plan, &checkpoint, &graph)?;
                tracing::info!(
                    done = plan.completed.len(),
                    rescheduled = plan.rescheduled.len(),
                    "resuming from checkpoint"
                );
                self.run(graph, None)
            }
            None => {
                tracing::info!("no checkpoint on disk, running a fresh build");
                self.run(graph, None)
            }
        }
    }

    /// Remove the cache directories and any checkpoint.
    pub fn clean(&self) -> Result<()> {
        self.cache.clear();
        self.checkpoints.discard();
        for dir in ["cas", "scratch", "sessions"] {
            let path = self.config.cache_dir.join(dir);
            if path.exists() {
                std::fs::remove_dir_all(&path).context("clean_cache_dir", path.display())?;
            }
        }
        tracing::info!(dir = %self.config.cache_dir.display(), "caches cleaned");
        Ok(())
    }

    /// Graph statistics for the whole workspace or one target's
    /// dependency closure.
    pub fn graph_stats(&self, target: Option<&TargetId>) -> Result<GraphStats> {
        let graph = BuildGraph::from_targets(self.targets.clone())?;
        match target {
            None => Ok(graph.stats()),
            Some(id) => {
                let scope = graph.reachable_from(id)?;
                let scoped = BuildGraph::from_targets(
                    self.targets
                        .iter()
                        .filter(|t| scope.contains(&t.id))
                        .cloned(),
                )?;
                Ok(scoped.stats())
            }
        }
    }

    fn run(&self, graph: Arc<BuildGraph>, target: Option<&TargetId>) -> Result<BuildReport> {
        let mut engine_config = EngineConfig::new(&self.config.workspace_root);
        engine_config.workers = self.config.workers;
        engine_config.checkpoint_interval = self.config.checkpoint_interval;
        engine_config.resources = self.config.resources;
        engine_config.determinism = self.config.determinism.clone();

        let mut engine = ExecutionEngine::new(
            graph.clone(),
            self.cache.clone(),
            self.sandbox.clone(),
            self.handlers.clone(),
            self.bus.clone(),
            engine_config,
        );

        if self.config.checkpoint_interval > 0 {
            let checkpoints = self.checkpoints.clone();
            let hook_graph = graph.clone();
            let bus = self.bus.clone();
            engine.set_checkpoint_hook(Arc::new(move |completed, total| {
                match checkpoints.save_from_graph(&hook_graph) {
                    Ok(_) => {
                        bus.publish(BuildEvent::CheckpointSaved { completed, total });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "periodic checkpoint failed");
                    }
                }
            }));
        }

        let result = engine.execute(target);
        self.cache.flush()?;

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                // Interrupted or cancelled: leave a checkpoint behind so
                // `resume` can pick the build up.
                let _ = self.checkpoints.save_from_graph(&graph);
                self.flush_telemetry();
                return Err(err);
            }
        };

        if report.success() {
            self.checkpoints.discard();
        } else {
            // Failed builds keep their checkpoint for a retry.
            let _ = self.checkpoints.save_from_graph(&graph);
        }
        self.flush_telemetry();
        Ok(self.finish_report(report))
    }

    fn finish_report(&self, report: ExecutionReport) -> BuildReport {
        BuildReport {
            targets: report.statuses,
            built: report.built,
            cached: report.cached,
            failed: report.failed,
            skipped: report.skipped,
            handler_invocations: report.handler_invocations,
            duration: report.duration,
            failures: report.failures,
            cache_stats: self.cache.stats(),
        }
    }

    fn flush_telemetry(&self) {
        let guard = self.telemetry_sub.lock();
        let Some(sub) = guard.as_ref() else {
            return;
        };
        let records = sub.drain();
        if records.is_empty() {
            return;
        }
        if let Err(err) = self.telemetry.record_session(&records) {
            tracing::warn!(error = %err, "telemetry session not recorded");
        }
    }
}

/// Map an API result onto the process exit-code contract:
/// 0 success, 1 build failure, 2 configuration/parse error, 3 internal.
pub fn exit_code(result: &Result<BuildReport>) -> i32 {
    match result {
        Ok(report) if report.success() => 0,
        Ok(_) => 1,
        Err(err) => match err.category() {
            // Bad build files surface as parse, analysis or graph
            // construction errors; all are configuration trouble.
            ErrorCategory::Parse | ErrorCategory::Analysis | ErrorCategory::Graph => 2,
            ErrorCategory::Internal => 3,
            _ => 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let failed_report = BuildReport {
            targets: HashMap::new(),
            built: 0,
            cached: 0,
            failed: 1,
            skipped: 0,
            handler_invocations: 1,
            duration: Duration::ZERO,
            failures: Vec::new(),
            cache_stats: CacheStats::default(),
        };
        assert_eq!(exit_code(&Ok(failed_report)), 1);
        assert_eq!(
            exit_code(&Err(BuildError::new(ErrorCode::InvalidBuildFile, "bad"))),
            2
        );
        assert_eq!(
            exit_code(&Err(BuildError::new(ErrorCode::CircularDependency, "loop"))),
            2
        );
        assert_eq!(exit_code(&Err(BuildError::internal("bug"))), 3);
        assert_eq!(
            exit_code(&Err(BuildError::new(ErrorCode::BuildCancelled, "stop"))),
            1
        );
    }
}
