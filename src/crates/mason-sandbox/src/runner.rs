//! The sandbox runner: validates a spec, executes the command under the
//! configured isolation backend, enforces the wall-clock limit in-process
//! and the remaining resource ceilings as child rlimits, and scans
//! outputs for nondeterminism.

use crate::{scan_artifact, NondeterminismWarning, NetworkPolicy, SandboxSpec};
use mason_error::{BuildError, ErrorCode, Result, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// What a sandboxed execution is asked to run.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; defaults to a private scratch dir.
    pub cwd: Option<PathBuf>,
}

impl SandboxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Terminal state of a sandboxed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failed,
    TimedOut,
    Killed,
}

/// Which resource ceiling a run tripped. Each maps to its own error
/// kind in [`ExecutionResult::to_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Memory,
    CpuTime,
    WallTime,
    FileSize,
    Processes,
}

/// Best-effort resource accounting; the portable backend fills what the
/// platform exposes cheaply and leaves the rest zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub wall_time_ms: u64,
    pub max_memory_bytes: u64,
    pub cpu_time_ms: u64,
}

/// The runner contract's return value.
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub resource_usage: ResourceUsage,
    /// The resource limit the run exceeded, if any.
    pub limit_exceeded: Option<LimitKind>,
    /// Declared output paths that exist after the run.
    pub output_artifacts: Vec<PathBuf>,
    pub nondeterminism_warnings: Vec<NondeterminismWarning>,
}

impl ExecutionResult {
    /// Map a non-success status onto the error taxonomy. Exceeded
    /// limits come first, each with its dedicated kind.
    pub fn to_error(&self) -> Option<BuildError> {
        if let Some(limit) = self.limit_exceeded {
            return Some(match limit {
                LimitKind::WallTime => BuildError::new(
                    ErrorCode::ProcessTimeout,
                    format!(
                        "wall-clock limit exceeded after {}ms",
                        self.duration.as_millis()
                    ),
                ),
                LimitKind::CpuTime => {
                    BuildError::new(ErrorCode::ProcessTimeout, "cpu time limit exceeded")
                }
                LimitKind::Memory => {
                    BuildError::new(ErrorCode::OutOfMemory, "memory limit exceeded")
                }
                LimitKind::FileSize => {
                    BuildError::new(ErrorCode::FileWriteFailed, "file size limit exceeded")
                }
                LimitKind::Processes => {
                    BuildError::new(ErrorCode::ProcessSpawnFailed, "process limit exceeded")
                }
            });
        }
        match self.status {
            ExecutionStatus::Success => None,
            ExecutionStatus::TimedOut => Some(BuildError::new(
                ErrorCode::ProcessTimeout,
                format!("sandboxed process exceeded {}ms", self.duration.as_millis()),
            )),
            ExecutionStatus::Killed => Some(BuildError::new(
                ErrorCode::ProcessCrashed,
                "sandboxed process was killed",
            )),
            ExecutionStatus::Failed => Some(
                BuildError::new(
                    ErrorCode::CompilationFailed,
                    format!(
                        "sandboxed process exited with code {}",
                        self.exit_code.unwrap_or(-1)
                    ),
                )
                .with_compiler_output(self.stderr.clone()),
            ),
        }
    }
}

/// OS-specific isolation mechanism. The portable backend never requires
/// containers; platform backends add namespaces/cgroups, sandbox
/// profiles or job objects behind the same seam.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply backend-specific settings to the command before spawn.
    fn prepare(&self, command: &mut Command, spec: &SandboxSpec) -> Result<()>;

    /// Ask a running child to stop; called once before the hard kill.
    fn terminate(&self, child: &mut Child) -> Result<()>;
}

/// Environment-scrub isolation: usable on every platform.
#[derive(Debug, Default)]
pub struct PortableBackend;

impl IsolationBackend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn prepare(&self, command: &mut Command, spec: &SandboxSpec) -> Result<()> {
        // env_clear upstream already stripped everything; here we only
        // neutralize network-by-proxy since this backend cannot block
        // sockets outright.
        if matches!(spec.network, NetworkPolicy::Hermetic) {
            command.env_remove("http_proxy");
            command.env_remove("https_proxy");
            command.env("NO_PROXY", "*");
        }
        apply_rlimits(command, &spec.resources);
        Ok(())
    }

    fn terminate(&self, child: &mut Child) -> Result<()> {
        child
            .kill()
            .map_err(BuildError::from)
            .context("terminate_sandboxed_process", child.id())
    }
}

/// Executes [`SandboxCommand`]s under a [`SandboxSpec`].
pub struct SandboxRunner {
    backend: Box<dyn IsolationBackend>,
    scratch_root: PathBuf,
    /// Pause between the polite terminate and the hard kill.
    grace_period: Duration,
}

impl SandboxRunner {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Box::new(PortableBackend),
            scratch_root: scratch_root.into(),
            grace_period: Duration::from_millis(500),
        }
    }

    pub fn with_backend(mut self, backend: Box<dyn IsolationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run `command` under `spec`.
    ///
    /// Fails fast on an invalid spec; otherwise always returns an
    /// [`ExecutionResult`], mapping process trouble onto its `status`.
    pub fn run(&self, spec: &SandboxSpec, command: &SandboxCommand) -> Result<ExecutionResult> {
        spec.validate()?;

        let scratch = self
            .scratch_root
            .join(format!("sandbox-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch).context("create_sandbox_scratch", scratch.display())?;

        let result = self.run_in_scratch(spec, command, &scratch);
        // Scratch contents never outlive the run; partial outputs cannot
        // leak into the cache.
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn run_in_scratch(
        &self,
        spec: &SandboxSpec,
        command: &SandboxCommand,
        scratch: &Path,
    ) -> Result<ExecutionResult> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(command.cwd.as_deref().unwrap_or(scratch))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(epoch) = spec.determinism.source_date_epoch {
            cmd.env("SOURCE_DATE_EPOCH", epoch.to_string());
        }
        self.backend.prepare(&mut cmd, spec)?;

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            BuildError::new(
                ErrorCode::ProcessSpawnFailed,
                format!("failed to spawn {}: {}", command.program, e),
            )
            .with_source(e)
        })?;

        // Drain the pipes concurrently; a chatty tool must not wedge on
        // a full pipe buffer while we wait for it to exit.
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Duration::from_millis(spec.resources.max_wall_time_ms);
        let (timed_out, exit_status) = self.wait_with_deadline(&mut child, deadline)?;
        let duration = started.elapsed();

        let stdout = stdout_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        let status = if timed_out {
            ExecutionStatus::TimedOut
        } else {
            match exit_status {
                Some(s) if s.success() => ExecutionStatus::Success,
                Some(s) if s.code().is_none() => ExecutionStatus::Killed,
                Some(_) => ExecutionStatus::Failed,
                None => ExecutionStatus::Killed,
            }
        };
        let limit_exceeded = if timed_out {
            Some(LimitKind::WallTime)
        } else {
            limit_from_signal(exit_status)
        };

        let output_artifacts: Vec<PathBuf> = spec
            .output_paths
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect();

        let nondeterminism_warnings = if status == ExecutionStatus::Success
            && spec.determinism.enabled()
        {
            self.scan_outputs(&output_artifacts)
        } else {
            Vec::new()
        };

        Ok(ExecutionResult {
            status,
            exit_code: exit_status.and_then(|s| s.code()),
            duration,
            stdout,
            stderr,
            resource_usage: ResourceUsage {
                wall_time_ms: duration.as_millis() as u64,
                ..ResourceUsage::default()
            },
            limit_exceeded,
            output_artifacts,
            nondeterminism_warnings,
        })
    }

    /// Poll until exit or deadline; on deadline, terminate, wait out the
    /// grace period, then hard-kill.
    fn wait_with_deadline(
        &self,
        child: &mut Child,
        deadline: Duration,
    ) -> Result<(bool, Option<std::process::ExitStatus>)> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(BuildError::from)? {
                return Ok((false, Some(status)));
            }
            if started.elapsed() >= deadline {
                let _ = self.backend.terminate(child);
                let grace_deadline = Instant::now() + self.grace_period;
                while Instant::now() < grace_deadline {
                    if let Some(status) = child.try_wait().map_err(BuildError::from)? {
                        return Ok((true, Some(status)));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                let _ = child.kill();
                let status = child.wait().ok();
                return Ok((true, status));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn scan_outputs(&self, artifacts: &[PathBuf]) -> Vec<NondeterminismWarning> {
        let mut warnings = Vec::new();
        for path in artifacts {
            match fs::read(path) {
                Ok(contents) => warnings.extend(scan_artifact(path, &contents)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "determinism scan skipped");
                }
            }
        }
        warnings
    }
}

/// Install the spec's resource ceilings as rlimits in the child,
/// between fork and exec. RLIMIT_NPROC is accounted per user on most
/// platforms, not per sandbox, so it is a guard rather than an exact
/// per-build count.
#[cfg(unix)]
fn apply_rlimits(command: &mut Command, limits: &crate::ResourceLimits) {
    use std::os::unix::process::CommandExt;
    let limits = *limits;
    unsafe {
        command.pre_exec(move || {
            set_rlimit(libc::RLIMIT_AS as libc::c_int, limits.max_memory_bytes)?;
            set_rlimit(libc::RLIMIT_FSIZE as libc::c_int, limits.max_file_size_bytes)?;
            set_rlimit(
                libc::RLIMIT_NPROC as libc::c_int,
                u64::from(limits.max_processes),
            )?;
            // Hard limit one second above soft: the soft limit's
            // SIGXCPU must arrive (and classify as a cpu overrun)
            // before the hard limit's SIGKILL.
            let cpu_secs = limits.max_cpu_time_ms.div_ceil(1000).max(1);
            set_rlimit_pair(libc::RLIMIT_CPU as libc::c_int, cpu_secs, cpu_secs + 1)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_command: &mut Command, _limits: &crate::ResourceLimits) {}

#[cfg(unix)]
fn set_rlimit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    set_rlimit_pair(resource, value, value)
}

#[cfg(unix)]
fn set_rlimit_pair(resource: libc::c_int, soft: u64, hard: u64) -> std::io::Result<()> {
    // An unprivileged process cannot raise its hard limit; clamp to
    // whatever ceiling the parent already lives under.
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource as _, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let hard = (hard as libc::rlim_t).min(current.rlim_max);
    let limit = libc::rlimit {
        rlim_cur: (soft as libc::rlim_t).min(hard),
        rlim_max: hard,
    };
    if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Classify a limit-violation signal. Only called off the wall-clock
/// path, so a SIGKILL here came from outside the runner (the kernel's
/// memory enforcement), never from our own terminate/kill sequence.
#[cfg(unix)]
fn limit_from_signal(status: Option<std::process::ExitStatus>) -> Option<LimitKind> {
    use std::os::unix::process::ExitStatusExt;
    let signal = status?.signal()?;
    if signal == libc::SIGXCPU {
        Some(LimitKind::CpuTime)
    } else if signal == libc::SIGXFSZ {
        Some(LimitKind::FileSize)
    } else if signal == libc::SIGKILL {
        Some(LimitKind::Memory)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn limit_from_signal(_status: Option<std::process::ExitStatus>) -> Option<LimitKind> {
    None
}

/// Build the minimal handler environment: explicit vars only, plus a
/// PATH when the caller wants tool lookup to work.
pub fn minimal_env(extra: &BTreeMap<String, String>, inherit_path: bool) -> BTreeMap<String, String> {
    let mut env = extra.clone();
    if inherit_path {
        if let Ok(path) = std::env::var("PATH") {
            env.entry("PATH".to_string()).or_insert(path);
        }
    }
    env
}
