//! User-visible error rendering: single errors, suggestion lookup, and the
//! numbered multi-error tree.

use crate::{BuildError, ErrorCode};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Suggestion text for codes where a standard remedy exists.
pub fn suggestion_for(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::CacheCorrupted => Some("run `clean` to reset the local caches"),
        ErrorCode::CacheLoadFailed => Some("the cache will be rebuilt on the next run"),
        ErrorCode::StaleCheckpoint => {
            Some("sources changed since the checkpoint; run a fresh build")
        }
        ErrorCode::MissingCompiler => {
            Some("install the language toolchain or set its path in the target opts")
        }
        ErrorCode::MissingDependency => {
            Some("check the `deps` list for typos or missing targets")
        }
        ErrorCode::NoAvailableWorkers => {
            Some("all workers are blacklisted or failed; check worker health")
        }
        ErrorCode::PermissionDenied => Some("check file ownership and permissions"),
        _ => None,
    }
}

pub(crate) fn render_error(err: &BuildError) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", err);

    for (i, frame) in err.context_frames().iter().enumerate() {
        let _ = writeln!(out, "{}{}", "  ".repeat(i + 1), frame);
    }

    let extras = err.extras();
    if !extras.is_empty() {
        if let Some(file) = &extras.file {
            match extras.line {
                Some(line) => {
                    let _ = writeln!(out, "  at {}:{}", file.display(), line);
                }
                None => {
                    let _ = writeln!(out, "  at {}", file.display());
                }
            }
        }
        if !extras.cycle_path.is_empty() {
            let _ = writeln!(out, "  cycle: {}", extras.cycle_path.join(" -> "));
        }
        if let Some(output) = &extras.compiler_output {
            let _ = writeln!(out, "  compiler output:");
            for line in output.lines() {
                let _ = writeln!(out, "    {}", line);
            }
        }
    }

    if let Some(hint) = suggestion_for(err.code()) {
        let _ = writeln!(out, "  hint: {}", hint);
    }

    out
}

/// A batch of errors rendered as a numbered tree with a per-category
/// summary line at the end.
#[derive(Debug, Default)]
pub struct ErrorReport {
    errors: Vec<BuildError>,
}

impl ErrorReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: BuildError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[BuildError] {
        &self.errors
    }

    /// Render all errors, numbered, followed by a category summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, err) in self.errors.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, err);
            for (depth, frame) in err.context_frames().iter().enumerate() {
                let _ = writeln!(out, "   {}{}", "  ".repeat(depth), frame);
            }
            if let Some(hint) = suggestion_for(err.code()) {
                let _ = writeln!(out, "   hint: {}", hint);
            }
        }

        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        for err in &self.errors {
            *by_category.entry(err.category().to_string()).or_default() += 1;
        }
        let summary: Vec<String> = by_category
            .into_iter()
            .map(|(cat, n)| format!("{}: {}", cat, n))
            .collect();
        let _ = writeln!(out, "{} error(s) [{}]", self.errors.len(), summary.join(", "));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResultExt;

    #[test]
    fn test_render_single_error_with_chain() {
        let err: crate::Result<()> =
            Err(BuildError::new(ErrorCode::CacheCorrupted, "bad magic"));
        let err = err
            .context("load_index", "cache/targets.bin")
            .unwrap_err();

        let rendered = err.render();
        assert!(rendered.contains("[Cache:403] bad magic"));
        assert!(rendered.contains("load_index: cache/targets.bin"));
        assert!(rendered.contains("hint: run `clean`"));
    }

    #[test]
    fn test_render_cycle_extras() {
        let err = BuildError::cycle(vec!["//a:a".into(), "//b:b".into(), "//a:a".into()]);
        let rendered = err.render();
        assert!(rendered.contains("cycle: //a:a -> //b:b -> //a:a"));
    }

    #[test]
    fn test_report_numbers_and_summarizes() {
        let mut report = ErrorReport::new();
        report.push(BuildError::new(ErrorCode::CompilationFailed, "type error"));
        report.push(BuildError::new(ErrorCode::CompilationFailed, "missing symbol"));
        report.push(BuildError::new(ErrorCode::NetworkError, "connection reset"));

        let rendered = report.render();
        assert!(rendered.contains("1. "));
        assert!(rendered.contains("3. "));
        assert!(rendered.contains("3 error(s)"));
        assert!(rendered.contains("Language: 2"));
        assert!(rendered.contains("Distributed: 1"));
    }
}
