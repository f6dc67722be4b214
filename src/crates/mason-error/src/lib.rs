//! Error types and error handling for the build core
//!
//! Every fallible operation in the workspace returns [`Result<T>`], a
//! `std::result::Result` specialized to [`BuildError`]. Errors carry a
//! stable numeric code (for logs and telemetry), a category, a context
//! chain accumulated as the error propagates, and optional source-specific
//! extras such as a cycle path or captured compiler output.
//!
//! # Error Hierarchy
//!
//! ```text
//! BuildError
//! ├── code: ErrorCode        - stable numeric identity (e.g. C403)
//! ├── message                - primary human-readable message
//! ├── context: [ContextFrame] - (operation, details, location) stack
//! ├── extras                 - file:line, compiler output, cycle path
//! └── source                 - wrapped causal error, if any
//! ```
//!
//! # Propagation
//!
//! ```rust
//! use mason_error::{BuildError, Result, ResultExt};
//!
//! fn read_manifest(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path)
//!         .map_err(BuildError::from)
//!         .context("read_manifest", path)
//! }
//! ```
//!
//! Transient errors (`NetworkError`, `Timeout`, `ProcessTimeout`) are
//! retryable per policy; `Internal` errors are fatal and surface
//! immediately. See [`BuildError::is_transient`] and
//! [`BuildError::is_fatal`].

mod code;
mod context;
mod report;

pub use code::{ErrorCategory, ErrorCode};
pub use context::{ContextFrame, ResultExt};
pub use report::ErrorReport;

use std::path::PathBuf;

/// Convenience result type using [`BuildError`].
pub type Result<T> = std::result::Result<T, BuildError>;

/// Source-specific extras attached to an error.
///
/// Only populated where a subsystem has something concrete to show: the
/// graph layer fills `cycle_path`, language handlers fill
/// `compiler_output`, filesystem errors fill `file`.
#[derive(Debug, Default, Clone)]
pub struct ErrorExtras {
    /// File the error refers to, if any.
    pub file: Option<PathBuf>,
    /// Line within `file`, if known.
    pub line: Option<u32>,
    /// Captured compiler or tool output.
    pub compiler_output: Option<String>,
    /// Offending dependency cycle, outermost first.
    pub cycle_path: Vec<String>,
}

impl ErrorExtras {
    fn is_empty(&self) -> bool {
        self.file.is_none()
            && self.compiler_output.is_none()
            && self.cycle_path.is_empty()
    }
}

/// The workspace-wide error type.
///
/// Constructed with [`BuildError::new`] or one of the shorthand
/// constructors, then enriched via [`ResultExt::context`] as it travels up
/// the stack. Rendering with [`BuildError::render`] prints the category
/// tag, code, message, the context chain innermost-outermost, extras, and
/// a suggestion when one is mapped for the code.
#[derive(Debug, thiserror::Error)]
#[error("[{}:{}] {}", .code.category(), .code.code(), .message)]
pub struct BuildError {
    code: ErrorCode,
    message: String,
    context: Vec<ContextFrame>,
    extras: ErrorExtras,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BuildError {
    /// Create an error with a code and primary message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Vec::new(),
            extras: ErrorExtras::default(),
            source: None,
        }
    }

    /// Create an internal error. These are fatal and never retried.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Create a `GraphCycle` error carrying the offending cycle path.
    pub fn cycle(path: Vec<String>) -> Self {
        let rendered = path.join(" -> ");
        let mut err = Self::new(
            ErrorCode::GraphCycle,
            format!("circular dependency: {rendered}"),
        );
        err.extras.cycle_path = path;
        err
    }

    /// Attach a causal error.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach a file path (and optionally a line) to the extras.
    pub fn with_file(mut self, file: impl Into<PathBuf>, line: Option<u32>) -> Self {
        self.extras.file = Some(file.into());
        self.extras.line = line;
        self
    }

    /// Attach captured compiler output.
    pub fn with_compiler_output(mut self, output: impl Into<String>) -> Self {
        self.extras.compiler_output = Some(output.into());
        self
    }

    /// Push a context frame. Frames accumulate innermost-first.
    pub fn push_context(mut self, frame: ContextFrame) -> Self {
        self.context.push(frame);
        self
    }

    /// Stable numeric code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Category derived from the code.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Primary message without context.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Accumulated context frames, innermost first.
    pub fn context_frames(&self) -> &[ContextFrame] {
        &self.context
    }

    /// Extras attached to this error.
    pub fn extras(&self) -> &ErrorExtras {
        &self.extras
    }

    /// Whether this error is retryable under a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::ProcessTimeout
        )
    }

    /// Whether this error must abort the build immediately.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Internal
    }

    /// Render the full multi-line report: tag, message, context chain
    /// (indented, innermost first), extras and suggestion.
    pub fn render(&self) -> String {
        report::render_error(self)
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::NotFound => ErrorCode::FileNotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::TimedOut => ErrorCode::Timeout,
            _ => ErrorCode::FileReadFailed,
        };
        Self::new(code, err.to_string()).with_source(err)
    }
}

/// Collect an iterator of results, short-circuiting on the first error.
///
/// The bulk-operation combinator used wherever a stage fans out over many
/// targets: all successes are returned in order, or the first failure.
pub fn collect_results<T, I>(results: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = Result<T>>,
{
    let iter = results.into_iter();
    let mut out = Vec::with_capacity(iter.size_hint().0);
    for result in iter {
        out.push(result?);
    }
    Ok(out)
}
