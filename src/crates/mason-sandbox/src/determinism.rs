//! Post-run scan for nondeterministic artifact content.
//!
//! Looks for the classic reproducibility offenders: embedded wall-clock
//! timestamps (ISO-8601, RFC-2822, raw epoch seconds) and freshly minted
//! UUIDs. A hit is a warning, not a failure; the handler may have a
//! legitimate reason, but the build log should say so.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// One suspected nondeterminism site in an output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NondeterminismWarning {
    pub artifact: String,
    pub pattern: String,
    pub matched: String,
}

struct Scanners {
    iso8601: Regex,
    rfc2822: Regex,
    epoch_seconds: Regex,
    uuid: Regex,
}

fn scanners() -> &'static Scanners {
    static SCANNERS: OnceLock<Scanners> = OnceLock::new();
    SCANNERS.get_or_init(|| Scanners {
        iso8601: Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").expect("static regex"),
        rfc2822: Regex::new(
            r"(Mon|Tue|Wed|Thu|Fri|Sat|Sun), \d{1,2} (Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) \d{4}",
        )
        .expect("static regex"),
        // Epoch seconds between 2001-09-09 and 2033-05-18; bare ten-digit
        // runs outside that band are almost never timestamps.
        epoch_seconds: Regex::new(r"\b1[0-9]{9}\b").expect("static regex"),
        uuid: Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .expect("static regex"),
    })
}

/// Scan one artifact's bytes. Binary content is examined through a lossy
/// UTF-8 view, which is enough to catch embedded text timestamps.
pub fn scan_artifact(path: &Path, contents: &[u8]) -> Vec<NondeterminismWarning> {
    let text = String::from_utf8_lossy(contents);
    let scanners = scanners();
    let mut warnings = Vec::new();

    let mut push = |pattern: &str, matched: Option<regex::Match<'_>>| {
        if let Some(m) = matched {
            warnings.push(NondeterminismWarning {
                artifact: path.display().to_string(),
                pattern: pattern.to_string(),
                matched: m.as_str().to_string(),
            });
        }
    };

    push("iso8601 timestamp", scanners.iso8601.find(&text));
    push("rfc2822 timestamp", scanners.rfc2822.find(&text));
    push("epoch seconds", scanners.epoch_seconds.find(&text));
    push("uuid", scanners.uuid.find(&text));

    warnings
}
