//! The seam between the core and per-language compiler integrations.
//!
//! Handlers are opaque to the core: the engine hands one a
//! [`BuildContext`] (target, dependency artifacts, a sandbox to run
//! tools in) and gets back the produced artifact bytes. Everything
//! language-specific (toolchain discovery, flags, `lang_config`
//! interpretation) lives behind the trait.

use mason_cache::ArtifactMetadata;
use mason_error::{BuildError, ErrorCode, Result};
use mason_graph::{Target, TargetId};
use mason_sandbox::{SandboxRunner, SandboxSpec};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One artifact produced by a handler. The engine owns persistence: it
/// writes the bytes into the CAS and records the metadata.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    /// Workspace-relative path the artifact belongs at.
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// What a successful handler invocation returns.
#[derive(Debug, Default)]
pub struct BuildOutput {
    pub artifacts: Vec<BuiltArtifact>,
    /// Handler log output worth keeping in the build report.
    pub log: String,
}

/// A dependency's already-built artifact, resolvable through the CAS.
#[derive(Debug, Clone)]
pub struct DepArtifact {
    pub target: TargetId,
    pub output_hash: String,
    pub metadata: ArtifactMetadata,
}

/// Everything a handler may look at while building one target.
pub struct BuildContext<'a> {
    pub target: &'a Target,
    pub workspace_root: &'a Path,
    /// Loaded source contents, in declared order.
    pub sources: &'a [(String, Vec<u8>)],
    pub deps: &'a [DepArtifact],
    /// Sandbox to run external tools under.
    pub sandbox: &'a SandboxRunner,
    /// Isolation the engine computed for this target; handlers pass it
    /// to `sandbox.run` (tightening is fine, loosening is not).
    pub sandbox_spec: &'a SandboxSpec,
}

/// A per-language compiler integration.
pub trait LanguageHandler: Send + Sync {
    /// Language tag this handler serves, e.g. `rust`.
    fn language(&self) -> &str;

    /// Build one target. Called off the critical path of other targets;
    /// may block internally, bounded by the sandbox resource limits.
    fn build(&self, ctx: &BuildContext<'_>) -> Result<BuildOutput>;
}

impl fmt::Debug for dyn LanguageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageHandler")
            .field("language", &self.language())
            .finish()
    }
}

/// Registry mapping language tags to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn LanguageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn LanguageHandler>) {
        self.handlers
            .insert(handler.language().to_string(), handler);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn LanguageHandler>> {
        self.handlers.get(language).cloned().ok_or_else(|| {
            BuildError::new(
                ErrorCode::UnsupportedLanguage,
                format!("no handler registered for language '{language}'"),
            )
        })
    }

    pub fn languages(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
