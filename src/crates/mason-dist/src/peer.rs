//! Worker-side view of peer and coordinator connections.
//!
//! Mirrors the coordinator's recovery structure: failures are classified
//! (network vs timeout), connection health walks Healthy -> Degraded ->
//! Failed, and failed peers sit out an exponential blacklist window
//! before being probed again.

use mason_error::BuildError;
use mason_error::ErrorCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Failures a peer connection can exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Network,
    Timeout,
    Other,
}

impl FailureKind {
    /// Classify an error by its taxonomy code.
    pub fn classify(err: &BuildError) -> Self {
        match err.code() {
            ErrorCode::Timeout | ErrorCode::ProcessTimeout => FailureKind::Timeout,
            ErrorCode::NetworkError => FailureKind::Network,
            _ => FailureKind::Other,
        }
    }
}

/// Connection health toward one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone)]
struct PeerState {
    health: PeerHealth,
    consecutive_failures: u32,
    network_failures: u64,
    timeout_failures: u64,
    blacklisted_until: Option<Instant>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            health: PeerHealth::Healthy,
            consecutive_failures: 0,
            network_failures: 0,
            timeout_failures: 0,
            blacklisted_until: None,
        }
    }
}

/// Consecutive failures before a peer degrades / fails.
const DEGRADE_AFTER: u32 = 2;
const FAIL_AFTER: u32 = 4;
const MAX_PEER_BLACKLIST: Duration = Duration::from_secs(300);

/// Tracks per-peer connection health on the worker side.
#[derive(Debug, Default)]
pub struct WorkerRecovery {
    peers: Mutex<HashMap<String, PeerState>>,
}

impl WorkerRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed exchange with `peer`. Returns the new health.
    pub fn record_failure(&self, peer: &str, err: &BuildError) -> PeerHealth {
        let kind = FailureKind::classify(err);
        let mut peers = self.peers.lock();
        let state = peers.entry(peer.to_string()).or_default();
        state.consecutive_failures += 1;
        match kind {
            FailureKind::Network => state.network_failures += 1,
            FailureKind::Timeout => state.timeout_failures += 1,
            FailureKind::Other => {}
        }

        state.health = if state.consecutive_failures >= FAIL_AFTER {
            let ban = Duration::from_secs(2u64.saturating_pow(state.consecutive_failures.min(32)))
                .min(MAX_PEER_BLACKLIST);
            state.blacklisted_until = Some(Instant::now() + ban);
            PeerHealth::Failed
        } else if state.consecutive_failures >= DEGRADE_AFTER {
            PeerHealth::Degraded
        } else {
            PeerHealth::Healthy
        };
        tracing::debug!(
            peer,
            kind = ?kind,
            consecutive = state.consecutive_failures,
            health = ?state.health,
            "peer failure recorded"
        );
        state.health
    }

    /// A successful exchange restores the peer.
    pub fn record_success(&self, peer: &str) {
        let mut peers = self.peers.lock();
        let state = peers.entry(peer.to_string()).or_default();
        state.consecutive_failures = 0;
        state.health = PeerHealth::Healthy;
        state.blacklisted_until = None;
    }

    pub fn health_of(&self, peer: &str) -> PeerHealth {
        self.peers
            .lock()
            .get(peer)
            .map(|s| s.health)
            .unwrap_or(PeerHealth::Healthy)
    }

    /// Whether the worker should attempt this peer right now.
    pub fn is_available(&self, peer: &str) -> bool {
        let peers = self.peers.lock();
        match peers.get(peer) {
            None => true,
            Some(state) => match state.blacklisted_until {
                Some(until) => until <= Instant::now(),
                None => state.health != PeerHealth::Failed,
            },
        }
    }

    /// (network, timeout) failure counters for one peer.
    pub fn failure_counts(&self, peer: &str) -> (u64, u64) {
        self.peers
            .lock()
            .get(peer)
            .map(|s| (s.network_failures, s.timeout_failures))
            .unwrap_or((0, 0))
    }
}
