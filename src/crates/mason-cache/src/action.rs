//! Action cache: finer-grained than the target tier.
//!
//! Handlers that split a build into several actions (compile, link, test)
//! key each one by [`ActionId`]. An entry is fresh only while its
//! recomputed input hash matches the stored one. Failed actions are
//! cached here, with an attempt counter and a TTL to damp retry storms,
//! but never in the target tier.

use crate::codec;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mason_error::{Result, ResultExt};
use mason_graph::TargetId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;

pub(crate) const ACTION_INDEX_MAGIC: u32 = 0x4254_4143; // "BTAC"
pub(crate) const ACTION_INDEX_VERSION: u8 = 1;

/// How long a cached failure suppresses identical re-runs.
const FAILURE_TTL_SECS: i64 = 300;
/// Failures past this attempt count stop being served from cache so a
/// manual retry can get through.
const FAILURE_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Compile,
    Link,
    Test,
    Transform,
    Lint,
    Other,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ActionType {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ActionType::Compile,
            1 => ActionType::Link,
            2 => ActionType::Test,
            3 => ActionType::Transform,
            4 => ActionType::Lint,
            _ => ActionType::Other,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ActionType::Compile => 0,
            ActionType::Link => 1,
            ActionType::Test => 2,
            ActionType::Transform => 3,
            ActionType::Lint => 4,
            ActionType::Other => 5,
        }
    }
}

/// Identity of one cacheable action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId {
    pub target: TargetId,
    pub action_type: ActionType,
    /// Distinguishes multiple actions of the same type under one target.
    pub sub_id: String,
    /// Hash over the action's declared inputs.
    pub input_hash: String,
}

impl ActionId {
    pub fn new(
        target: impl Into<TargetId>,
        action_type: ActionType,
        sub_id: impl Into<String>,
        input_hash: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            action_type,
            sub_id: sub_id.into(),
            input_hash: input_hash.into(),
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.target, self.action_type, self.sub_id, self.input_hash
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCacheEntry {
    pub action: ActionId,
    pub input_hashes: Vec<String>,
    pub output_hashes: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// Consecutive failed attempts recorded for this action.
    pub attempts: u32,
}

/// The action cache tier, one mutex, flushed like the target tier.
#[derive(Debug)]
pub struct ActionCache {
    entries: Mutex<HashMap<ActionId, ActionCacheEntry>>,
    index_path: PathBuf,
}

impl ActionCache {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let index_path = dir.into().join("actions.bin");
        let entries = match Self::load_index(&index_path) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    path = %index_path.display(),
                    error = %err,
                    "action cache index unreadable, starting empty"
                );
                HashMap::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            index_path,
        }
    }

    /// Fresh-entry lookup: the stored entry is returned only when its
    /// input hash still matches `recomputed_input_hash`; anything else is
    /// a miss. Cached failures are served only while young and under the
    /// attempt cap.
    pub fn get(&self, id: &ActionId, recomputed_input_hash: &str) -> Option<ActionCacheEntry> {
        let entries = self.entries.lock();
        let entry = entries.get(id)?;
        if entry.action.input_hash != recomputed_input_hash {
            return None;
        }
        if !entry.success {
            let age = Utc::now() - entry.timestamp;
            if age > Duration::seconds(FAILURE_TTL_SECS)
                || entry.attempts >= FAILURE_MAX_ATTEMPTS
            {
                return None;
            }
        }
        Some(entry.clone())
    }

    /// Record a successful action.
    pub fn insert(&self, entry: ActionCacheEntry) {
        self.entries.lock().insert(entry.action.clone(), entry);
    }

    /// Record a failure, bumping the attempt counter of an existing
    /// failure entry for the same action.
    pub fn record_failure(&self, id: &ActionId, metadata: BTreeMap<String, String>) {
        let mut entries = self.entries.lock();
        let attempts = entries
            .get(id)
            .filter(|e| !e.success)
            .map(|e| e.attempts + 1)
            .unwrap_or(1);
        entries.insert(
            id.clone(),
            ActionCacheEntry {
                action: id.clone(),
                input_hashes: vec![id.input_hash.clone()],
                output_hashes: Vec::new(),
                metadata,
                success: false,
                timestamp: Utc::now(),
                attempts,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn referenced_hashes(&self) -> Vec<String> {
        let entries = self.entries.lock();
        entries
            .values()
            .flat_map(|e| e.output_hashes.iter().cloned())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        let _ = fs::remove_file(&self.index_path);
    }

    pub fn flush(&self) -> Result<()> {
        let entries = self.entries.lock();
        let mut out = Vec::new();
        codec::write_envelope(&mut out, ACTION_INDEX_MAGIC, ACTION_INDEX_VERSION);
        let mut sorted: Vec<&ActionCacheEntry> = entries.values().collect();
        sorted.sort_by_key(|e| e.action.to_string());
        out.extend_from_slice(&(sorted.len() as u64).to_be_bytes());
        for entry in sorted {
            encode_entry(&mut out, entry);
        }
        drop(entries);

        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent).context("create_cache_dir", parent.display())?;
        }
        let tmp = self.index_path.with_extension("bin.tmp");
        fs::write(&tmp, &out).context("write_action_index", tmp.display())?;
        fs::rename(&tmp, &self.index_path)
            .context("publish_action_index", self.index_path.display())?;
        Ok(())
    }

    fn load_index(path: &PathBuf) -> Result<HashMap<ActionId, ActionCacheEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(path).context("read_action_index", path.display())?;
        let slice: &[u8] = &bytes;
        let mut cursor = Cursor::new(slice);
        codec::check_envelope(
            &mut cursor,
            ACTION_INDEX_MAGIC,
            ACTION_INDEX_VERSION,
            "action index",
        )?;
        let count = codec::read_u64(&mut cursor, "action index count")?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let entry = decode_entry(&mut cursor)?;
            entries.insert(entry.action.clone(), entry);
        }
        Ok(entries)
    }
}

fn encode_entry(out: &mut Vec<u8>, entry: &ActionCacheEntry) {
    codec::write_str(out, entry.action.target.as_str());
    out.push(entry.action.action_type.as_u8());
    codec::write_str(out, &entry.action.sub_id);
    codec::write_str(out, &entry.action.input_hash);

    out.extend_from_slice(&(entry.input_hashes.len() as u64).to_be_bytes());
    for hash in &entry.input_hashes {
        codec::write_str(out, hash);
    }
    out.extend_from_slice(&(entry.output_hashes.len() as u64).to_be_bytes());
    for hash in &entry.output_hashes {
        codec::write_str(out, hash);
    }
    out.extend_from_slice(&(entry.metadata.len() as u64).to_be_bytes());
    for (key, value) in &entry.metadata {
        codec::write_str(out, key);
        codec::write_str(out, value);
    }
    out.push(u8::from(entry.success));
    out.extend_from_slice(&(entry.timestamp.timestamp_millis() as u64).to_be_bytes());
    out.extend_from_slice(&entry.attempts.to_be_bytes());
}

fn decode_entry(cursor: &mut Cursor<&[u8]>) -> Result<ActionCacheEntry> {
    let target = TargetId::from(codec::read_str(cursor, "action target")?);
    let action_type = ActionType::from_u8(codec::read_u8(cursor, "action type")?);
    let sub_id = codec::read_str(cursor, "action sub id")?;
    let input_hash = codec::read_str(cursor, "action input hash")?;

    let input_count = codec::read_u64(cursor, "input count")?;
    let mut input_hashes = Vec::with_capacity(input_count as usize);
    for _ in 0..input_count {
        input_hashes.push(codec::read_str(cursor, "input hash")?);
    }
    let output_count = codec::read_u64(cursor, "output count")?;
    let mut output_hashes = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        output_hashes.push(codec::read_str(cursor, "output hash")?);
    }
    let meta_count = codec::read_u64(cursor, "metadata count")?;
    let mut metadata = BTreeMap::new();
    for _ in 0..meta_count {
        let key = codec::read_str(cursor, "metadata key")?;
        let value = codec::read_str(cursor, "metadata value")?;
        metadata.insert(key, value);
    }
    let success = codec::read_u8(cursor, "success flag")? != 0;
    let millis = codec::read_u64(cursor, "action timestamp")?;
    let timestamp = Utc
        .timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| codec::corrupted("action timestamp out of range"))?;
    let mut attempt_bytes = [0u8; 4];
    std::io::Read::read_exact(cursor, &mut attempt_bytes)
        .map_err(|_| codec::corrupted("truncated attempts"))?;
    let attempts = u32::from_be_bytes(attempt_bytes);

    Ok(ActionCacheEntry {
        action: ActionId {
            target,
            action_type,
            sub_id,
            input_hash,
        },
        input_hashes,
        output_hashes,
        metadata,
        success,
        timestamp,
        attempts,
    })
}
