//! Build configuration: explicit builder with environment overlays.

use mason_cache::RemoteCacheConfig;
use mason_events::TelemetryConfig;
use mason_sandbox::{DeterminismSpec, ResourceLimits};
use std::path::PathBuf;

/// Everything the facade needs to wire the services.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub workspace_root: PathBuf,
    /// Local cache tiers and CAS live here.
    pub cache_dir: PathBuf,
    /// 0 = one worker per logical CPU.
    pub workers: usize,
    /// Completions between checkpoints; 0 disables autosave.
    pub checkpoint_interval: usize,
    pub remote: Option<RemoteCacheConfig>,
    pub telemetry: TelemetryConfig,
    pub resources: ResourceLimits,
    pub determinism: DeterminismSpec,
}

impl BuildConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            cache_dir: workspace_root.join(".mason-cache"),
            workspace_root,
            workers: 0,
            checkpoint_interval: 10,
            remote: None,
            telemetry: TelemetryConfig::default(),
            resources: ResourceLimits::default(),
            determinism: DeterminismSpec::default(),
        }
    }

    /// Overlay the environment contract: `REMOTE_CACHE_*` and
    /// `BUILDER_TELEMETRY_*`.
    pub fn from_env(mut self) -> Self {
        if let Some(remote) = RemoteCacheConfig::from_env() {
            self.remote = Some(remote);
        }
        self.telemetry = TelemetryConfig::from_env();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_remote(mut self, remote: RemoteCacheConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_determinism(mut self, determinism: DeterminismSpec) -> Self {
        self.determinism = determinism;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::new("/ws");
        assert_eq!(config.cache_dir, PathBuf::from("/ws/.mason-cache"));
        assert_eq!(config.workers, 0);
        assert!(config.remote.is_none());
        assert!(!config.telemetry.enabled);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BuildConfig::new("/ws")
            .with_cache_dir("/elsewhere")
            .with_workers(8)
            .with_checkpoint_interval(5);
        assert_eq!(config.cache_dir, PathBuf::from("/elsewhere"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.checkpoint_interval, 5);
    }
}
