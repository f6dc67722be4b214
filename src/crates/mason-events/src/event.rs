//! The event taxonomy: one tagged variant per core transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A structured build event with a fixed payload shape per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildEvent {
    CacheHit {
        target: String,
        remote: bool,
    },
    CacheMiss {
        target: String,
        fingerprint: String,
    },
    CacheUpdate {
        target: String,
        fingerprint: String,
    },
    ActionHit {
        target: String,
        action: String,
    },
    ActionMiss {
        target: String,
        action: String,
    },
    RemotePush {
        fingerprint: String,
        ok: bool,
    },
    TargetStarted {
        target: String,
    },
    TargetCompleted {
        target: String,
        duration_ms: u64,
    },
    TargetFailed {
        target: String,
        error_code: u16,
        message: String,
    },
    TargetSkipped {
        target: String,
        failed_ancestor: String,
    },
    WorkerFailed {
        worker: String,
        in_progress: usize,
    },
    Reassignment {
        action: String,
        from_worker: String,
        to_worker: String,
    },
    CheckpointSaved {
        completed: usize,
        total: usize,
    },
    NondeterminismWarning {
        target: String,
        artifact: String,
        detail: String,
    },
}

impl BuildEvent {
    /// Target id the event concerns, when it concerns one.
    pub fn target(&self) -> Option<&str> {
        match self {
            BuildEvent::CacheHit { target, .. }
            | BuildEvent::CacheMiss { target, .. }
            | BuildEvent::CacheUpdate { target, .. }
            | BuildEvent::ActionHit { target, .. }
            | BuildEvent::ActionMiss { target, .. }
            | BuildEvent::TargetStarted { target }
            | BuildEvent::TargetCompleted { target, .. }
            | BuildEvent::TargetFailed { target, .. }
            | BuildEvent::TargetSkipped { target, .. }
            | BuildEvent::NondeterminismWarning { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// An event as delivered: payload plus ordering metadata.
///
/// `seq` is a bus-wide monotonic counter and `monotonic_ms` is measured
/// from bus creation, so consumers can order and interval events without
/// trusting the wall clock; `timestamp` is for humans and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub monotonic_ms: u64,
    #[serde(flatten)]
    pub event: BuildEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = BuildEvent::CacheHit {
            target: "//lib:lib".into(),
            remote: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "cache_hit");
        assert_eq!(json["target"], "//lib:lib");
        assert_eq!(json["remote"], false);
    }

    #[test]
    fn test_record_round_trips() {
        let record = EventRecord {
            seq: 7,
            timestamp: Utc::now(),
            monotonic_ms: 123,
            event: BuildEvent::TargetCompleted {
                target: "//app:app".into(),
                duration_ms: 456,
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_target_accessor() {
        let event = BuildEvent::RemotePush {
            fingerprint: "ab".into(),
            ok: true,
        };
        assert!(event.target().is_none());
        let event = BuildEvent::TargetStarted {
            target: "//a:a".into(),
        };
        assert_eq!(event.target(), Some("//a:a"));
    }
}
