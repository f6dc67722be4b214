//! Declarative build targets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stable, namespaced target identifier, e.g. `//services/api:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What kind of artifact a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Executable,
    Library,
    Test,
    Custom,
}

/// A declarative build unit, read-only after parse.
///
/// The configuration layer produces a stream of these; the core never
/// mutates one. `opts` is ordered (BTreeMap) so fingerprinting sees a
/// canonical key order, and `lang_config` is opaque to the core; only
/// the owning language handler interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    /// Language tag selecting the handler, e.g. `rust`, `java`.
    pub language: String,
    /// Ordered source paths, workspace-relative.
    pub sources: Vec<PathBuf>,
    /// Ordered dependency ids.
    pub deps: Vec<TargetId>,
    /// Per-language options visible to the handler and the fingerprint.
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
    /// Free-form flags passed through to the handler.
    #[serde(default)]
    pub flags: Vec<String>,
    /// Explicit output path, if the target pins one.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Opaque per-handler configuration.
    #[serde(default)]
    pub lang_config: Option<serde_json::Value>,
}

impl Target {
    /// Minimal constructor used by tests and programmatic callers; the
    /// builder methods fill in the rest.
    pub fn new(id: impl Into<TargetId>, kind: TargetKind, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            language: language.into(),
            sources: Vec::new(),
            deps: Vec::new(),
            opts: BTreeMap::new(),
            flags: Vec::new(),
            output_path: None,
            lang_config: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_deps(mut self, deps: Vec<TargetId>) -> Self {
        self.deps = deps;
        self
    }

    pub fn with_opt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.insert(key.into(), value.into());
        self
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}
