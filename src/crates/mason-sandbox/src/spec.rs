//! The sandbox specification: pure data, independent of the enforcement
//! mechanism.

use mason_error::{BuildError, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// What network access the sandboxed process gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network at all.
    #[default]
    Hermetic,
    /// Loopback only.
    AllowLocalhost,
    /// Only the listed hosts.
    AllowListed { hosts: Vec<String> },
}

/// Hard resource ceilings; exceeding one yields a dedicated error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_time_ms: u64,
    pub max_wall_time_ms: u64,
    pub max_processes: u32,
    pub max_file_size_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 4 * 1024 * 1024 * 1024,
            max_cpu_time_ms: 10 * 60 * 1000,
            max_wall_time_ms: 15 * 60 * 1000,
            // RLIMIT_NPROC counts the whole user, not one sandbox; a
            // tight default would starve builds on busy machines.
            max_processes: 4096,
            max_file_size_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Determinism requirements for the produced artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeterminismSpec {
    /// Pinned `SOURCE_DATE_EPOCH` for tools that embed build times.
    pub source_date_epoch: Option<u64>,
    /// Path prefix remappings applied to tool arguments (e.g. to strip
    /// absolute workspace prefixes out of debug info).
    #[serde(default)]
    pub path_remaps: BTreeMap<PathBuf, PathBuf>,
    /// Scan outputs for embedded timestamps and UUIDs after the run.
    pub strict_timestamp_check: bool,
}

impl DeterminismSpec {
    pub fn enabled(&self) -> bool {
        self.source_date_epoch.is_some() || self.strict_timestamp_check
    }
}

/// Complete description of one hermetic execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SandboxSpec {
    /// Paths the process may read.
    pub input_paths: Vec<PathBuf>,
    /// Paths the process may create or write.
    pub output_paths: Vec<PathBuf>,
    /// The entire environment; everything else is stripped.
    pub env: BTreeMap<String, String>,
    pub network: NetworkPolicy,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub determinism: DeterminismSpec,
}

impl SandboxSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inputs(mut self, paths: Vec<PathBuf>) -> Self {
        self.input_paths = paths;
        self
    }

    pub fn with_outputs(mut self, paths: Vec<PathBuf>) -> Self {
        self.output_paths = paths;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
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

    /// Reject specs the runner cannot enforce coherently: overlapping
    /// input/output sets and zero-duration limits.
    pub fn validate(&self) -> Result<()> {
        let inputs: HashSet<&PathBuf> = self.input_paths.iter().collect();
        for output in &self.output_paths {
            if inputs.contains(output) {
                return Err(invalid_spec(format!(
                    "path {} appears in both inputs and outputs",
                    output.display()
                )));
            }
        }
        if self.resources.max_wall_time_ms == 0 {
            return Err(invalid_spec("max_wall_time_ms must be positive"));
        }
        if self.resources.max_processes == 0 {
            return Err(invalid_spec("max_processes must be positive"));
        }
        Ok(())
    }
}

fn invalid_spec(msg: impl Into<String>) -> BuildError {
    BuildError::new(
        ErrorCode::InvalidFieldValue,
        format!("invalid sandbox spec: {}", msg.into()),
    )
}
