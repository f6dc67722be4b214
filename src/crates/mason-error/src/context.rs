//! Context frames and the `ResultExt` propagation helper.

use crate::{BuildError, Result};
use std::fmt;
use std::panic::Location;

/// One frame of the context chain: what operation was running, any
/// operation-specific details, and the source location that attached the
/// frame.
#[derive(Debug, Clone)]
pub struct ContextFrame {
    /// Operation name, e.g. `load_target_cache`.
    pub operation: String,
    /// Free-form details, e.g. the path or target id involved.
    pub details: String,
    /// `file:line` of the call site that attached this frame.
    pub location: String,
}

impl ContextFrame {
    #[track_caller]
    pub fn new(operation: impl Into<String>, details: impl Into<String>) -> Self {
        let loc = Location::caller();
        Self {
            operation: operation.into(),
            details: details.into(),
            location: format!("{}:{}", loc.file(), loc.line()),
        }
    }
}

impl fmt::Display for ContextFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{} ({})", self.operation, self.location)
        } else {
            write!(f, "{}: {} ({})", self.operation, self.details, self.location)
        }
    }
}

/// Extension adding context-frame accumulation to `Result`.
///
/// Frames stack innermost-first, so rendering walks the chain in the order
/// the error actually travelled.
pub trait ResultExt<T> {
    /// Attach a context frame if the result is an error.
    fn context(self, operation: &str, details: impl fmt::Display) -> Result<T>;

    /// Attach a lazily-built context frame if the result is an error.
    fn with_context<F, D>(self, operation: &str, details: F) -> Result<T>
    where
        F: FnOnce() -> D,
        D: fmt::Display;
}

impl<T> ResultExt<T> for Result<T> {
    #[track_caller]
    fn context(self, operation: &str, details: impl fmt::Display) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(e.push_context(ContextFrame::new(operation, details.to_string()))),
        }
    }

    #[track_caller]
    fn with_context<F, D>(self, operation: &str, details: F) -> Result<T>
    where
        F: FnOnce() -> D,
        D: fmt::Display,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => {
                Err(e.push_context(ContextFrame::new(operation, details().to_string())))
            }
        }
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    #[track_caller]
    fn context(self, operation: &str, details: impl fmt::Display) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(BuildError::from(e)
                .push_context(ContextFrame::new(operation, details.to_string()))),
        }
    }

    #[track_caller]
    fn with_context<F, D>(self, operation: &str, details: F) -> Result<T>
    where
        F: FnOnce() -> D,
        D: fmt::Display,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(BuildError::from(e)
                .push_context(ContextFrame::new(operation, details().to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn inner() -> Result<()> {
        Err(BuildError::new(ErrorCode::FileReadFailed, "disk says no"))
    }

    fn middle() -> Result<()> {
        inner().context("load_sources", "//lib:lib")
    }

    fn outer() -> Result<()> {
        middle().context("build_target", "//lib:lib")
    }

    #[test]
    fn test_frames_accumulate_innermost_first() {
        let err = outer().unwrap_err();
        let frames = err.context_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].operation, "load_sources");
        assert_eq!(frames[1].operation, "build_target");
        assert!(frames[0].location.contains("context.rs"));
    }

    #[test]
    fn test_io_result_context() {
        let r: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = r.context("write_blob", "cas/blobs/ab/cd").unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert_eq!(err.context_frames()[0].operation, "write_blob");
    }

    #[test]
    fn test_ok_passes_through_untouched() {
        let r: Result<u8> = Ok(7);
        assert_eq!(r.context("noop", "").unwrap(), 7);
    }
}
