//! Session recording for the telemetry pipeline.
//!
//! A session is one build: its event records are written as JSON lines
//! next to a small binary summary. Storage is bounded by the
//! `BUILDER_TELEMETRY_MAX_SESSIONS` and `BUILDER_TELEMETRY_RETENTION_DAYS`
//! environment knobs and disabled entirely unless
//! `BUILDER_TELEMETRY_ENABLED` is `1` or `true`.

use crate::EventRecord;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Duration, Utc};
use mason_error::{BuildError, ErrorCode, Result, ResultExt};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

const SUMMARY_MAGIC: u32 = 0x4254_544D; // "BTTM"
const SUMMARY_VERSION: u8 = 1;

/// Telemetry configuration, usually sourced from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub max_sessions: usize,
    pub retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_sessions: 50,
            retention_days: 30,
        }
    }
}

impl TelemetryConfig {
    /// Read `BUILDER_TELEMETRY_*` from the process environment, falling
    /// back to defaults for unset or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = matches!(
            std::env::var("BUILDER_TELEMETRY_ENABLED").as_deref(),
            Ok("1") | Ok("true")
        );
        let max_sessions = std::env::var("BUILDER_TELEMETRY_MAX_SESSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_sessions);
        let retention_days = std::env::var("BUILDER_TELEMETRY_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.retention_days);
        Self {
            enabled,
            max_sessions,
            retention_days,
        }
    }
}

/// A recorded session's summary, as stored in `summary.bin`.
///
/// The duration is pinned on disk as u64 big-endian milliseconds; the
/// width and byte order are part of the format, not an implementation
/// detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub events: u64,
    pub duration_ms: u64,
}

/// Writes finished sessions under `<dir>/sessions/<session-id>/`.
#[derive(Debug)]
pub struct TelemetrySink {
    config: TelemetryConfig,
    sessions_dir: PathBuf,
}

impl TelemetrySink {
    pub fn new(root: impl Into<PathBuf>, config: TelemetryConfig) -> Self {
        Self {
            sessions_dir: root.into().join("sessions"),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Persist one session. Returns the session directory, or `None`
    /// when telemetry is disabled.
    pub fn record_session(&self, records: &[EventRecord]) -> Result<Option<PathBuf>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = self.sessions_dir.join(&session_id);
        fs::create_dir_all(&dir).context("create_session_dir", dir.display())?;

        let mut lines = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(|e| {
                BuildError::new(ErrorCode::InvalidJson, e.to_string()).with_source(e)
            })?;
            lines.push_str(&line);
            lines.push('\n');
        }
        let events_path = dir.join("events.jsonl");
        fs::write(&events_path, lines).context("write_session_events", events_path.display())?;

        let duration_ms = match (records.first(), records.last()) {
            (Some(first), Some(last)) => last.monotonic_ms.saturating_sub(first.monotonic_ms),
            _ => 0,
        };
        let summary = SessionSummary {
            events: records.len() as u64,
            duration_ms,
        };
        let summary_path = dir.join("summary.bin");
        fs::write(&summary_path, encode_summary(&summary))
            .context("write_session_summary", summary_path.display())?;

        self.prune()?;
        tracing::debug!(session = %session_id, events = records.len(), "telemetry session recorded");
        Ok(Some(dir))
    }

    pub fn read_summary(path: &Path) -> Result<SessionSummary> {
        let bytes = fs::read(path).context("read_session_summary", path.display())?;
        decode_summary(&bytes)
    }

    /// Drop sessions beyond `max_sessions` (oldest first) and any older
    /// than the retention window.
    fn prune(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let mut sessions: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();
        sessions.sort_by_key(|(modified, _)| *modified);

        let cutoff = Utc::now() - Duration::days(i64::from(self.config.retention_days));
        let mut remaining = sessions.len();
        for (modified, path) in &sessions {
            let age_expired =
                chrono::DateTime::<Utc>::from(*modified) < cutoff;
            let over_budget = remaining > self.config.max_sessions;
            if age_expired || over_budget {
                if fs::remove_dir_all(path).is_ok() {
                    remaining -= 1;
                }
            }
        }
        Ok(())
    }
}

fn encode_summary(summary: &SessionSummary) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 8 + 8);
    out.write_u32::<BigEndian>(SUMMARY_MAGIC).expect("vec write");
    out.write_u8(SUMMARY_VERSION).expect("vec write");
    out.write_u64::<BigEndian>(summary.events).expect("vec write");
    // Duration pinned to u64 big-endian milliseconds.
    out.write_u64::<BigEndian>(summary.duration_ms).expect("vec write");
    out
}

fn decode_summary(bytes: &[u8]) -> Result<SessionSummary> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| corrupted("summary truncated"))?;
    if magic != SUMMARY_MAGIC {
        return Err(corrupted("summary magic mismatch"));
    }
    let version = cursor.read_u8().map_err(|_| corrupted("summary truncated"))?;
    if version != SUMMARY_VERSION {
        return Err(corrupted(format!("unknown summary version {version}")));
    }
    let events = cursor
        .read_u64::<BigEndian>()
        .map_err(|_| corrupted("summary truncated"))?;
    let duration_ms = cursor
        .read_u64::<BigEndian>()
        .map_err(|_| corrupted("summary truncated"))?;
    Ok(SessionSummary {
        events,
        duration_ms,
    })
}

fn corrupted(msg: impl Into<String>) -> BuildError {
    BuildError::new(ErrorCode::CacheCorrupted, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuildEvent, EventBus};

    fn config() -> TelemetryConfig {
        TelemetryConfig {
            enabled: true,
            max_sessions: 3,
            retention_days: 30,
        }
    }

    fn sample_records(n: usize) -> Vec<EventRecord> {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for i in 0..n {
            bus.publish(BuildEvent::TargetStarted {
                target: format!("//t:{}", i),
            });
        }
        sub.drain()
    }

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = TelemetrySink::new(tmp.path(), TelemetryConfig::default());
        let out = sink.record_session(&sample_records(2)).unwrap();
        assert!(out.is_none());
        assert!(!sink.sessions_dir().exists());
    }

    #[test]
    fn test_session_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = TelemetrySink::new(tmp.path(), config());
        let dir = sink.record_session(&sample_records(4)).unwrap().unwrap();

        let events = fs::read_to_string(dir.join("events.jsonl")).unwrap();
        assert_eq!(events.lines().count(), 4);

        let summary = TelemetrySink::read_summary(&dir.join("summary.bin")).unwrap();
        assert_eq!(summary.events, 4);
    }

    #[test]
    fn test_summary_encoding_is_big_endian() {
        let encoded = encode_summary(&SessionSummary {
            events: 1,
            duration_ms: 0x0102_0304,
        });
        // magic(4) + version(1) + events(8), then duration bytes.
        assert_eq!(&encoded[13..21], &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_summary_rejects_unknown_version() {
        let mut encoded = encode_summary(&SessionSummary {
            events: 0,
            duration_ms: 0,
        });
        encoded[4] = 9;
        let err = decode_summary(&encoded).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CacheCorrupted);
    }

    #[test]
    fn test_prune_caps_session_count() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = TelemetrySink::new(tmp.path(), config());
        for _ in 0..5 {
            sink.record_session(&sample_records(1)).unwrap();
        }
        let count = fs::read_dir(sink.sessions_dir()).unwrap().count();
        assert!(count <= 3, "expected at most 3 sessions, found {}", count);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Unset in the test environment, so defaults apply.
        let config = TelemetryConfig::from_env();
        assert_eq!(config.max_sessions, TelemetryConfig::default().max_sessions);
    }
}
