//! Deterministic fingerprints over target inputs.
//!
//! A fingerprint is a pure function of (target id, canonicalized source
//! contents, canonicalized dependency fingerprints, handler-visible
//! options), never of wall-clock time or host identity. Two independent
//! invocations on identical inputs yield identical bytes.

use mason_graph::Target;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex-encoded blake3 digest identifying a (target, inputs, options)
/// tuple. The target-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hash arbitrary bytes into a fingerprint.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental fingerprint construction.
///
/// Every field is fed through a length-prefixed domain so adjacent inputs
/// can never alias (e.g. sources `["ab", "c"]` vs `["a", "bc"]`).
#[derive(Debug)]
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    pub fn new(target_id: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        feed(&mut hasher, b"target-id", target_id.as_bytes());
        Self { hasher }
    }

    /// Add one source file's contents. Order matters: callers feed
    /// sources in the target's declared order.
    pub fn source(&mut self, path: &str, contents: &[u8]) -> &mut Self {
        feed(&mut self.hasher, b"source-path", path.as_bytes());
        feed(&mut self.hasher, b"source-data", contents);
        self
    }

    /// Add one dependency fingerprint. Callers feed these sorted by
    /// dependency id so the encoding is canonical.
    pub fn dep(&mut self, fingerprint: &Fingerprint) -> &mut Self {
        feed(&mut self.hasher, b"dep", fingerprint.as_str().as_bytes());
        self
    }

    /// Add one handler-visible option. `Target::opts` is a BTreeMap, so
    /// iteration is already in canonical key order.
    pub fn opt(&mut self, key: &str, value: &str) -> &mut Self {
        feed(&mut self.hasher, b"opt-key", key.as_bytes());
        feed(&mut self.hasher, b"opt-value", value.as_bytes());
        self
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().to_hex().to_string())
    }

    /// Full fingerprint for a target given loaded source contents and
    /// already-computed dependency fingerprints (keyed by dep id).
    pub fn for_target(
        target: &Target,
        sources: &[(String, Vec<u8>)],
        dep_fingerprints: &[(String, Fingerprint)],
    ) -> Fingerprint {
        let mut builder = Self::new(target.id.as_str());
        for (path, contents) in sources {
            builder.source(path, contents);
        }
        let mut deps: Vec<&(String, Fingerprint)> = dep_fingerprints.iter().collect();
        deps.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, fp) in deps {
            builder.dep(fp);
        }
        for (key, value) in &target.opts {
            builder.opt(key, value);
        }
        for flag in &target.flags {
            builder.opt("flag", flag);
        }
        builder.finish()
    }
}

fn feed(hasher: &mut blake3::Hasher, domain: &[u8], data: &[u8]) {
    hasher.update(&(domain.len() as u64).to_be_bytes());
    hasher.update(domain);
    hasher.update(&(data.len() as u64).to_be_bytes());
    hasher.update(data);
}
