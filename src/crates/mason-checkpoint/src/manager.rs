//! Checkpoint persistence: versioned binary envelope, atomic writes.

use crate::Checkpoint;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mason_error::{BuildError, ErrorCode, Result, ResultExt};
use mason_graph::BuildGraph;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;

const CHECKPOINT_MAGIC: u32 = 0x4254_434B; // "BTCK"
const CHECKPOINT_VERSION: u8 = 1;

/// Owns `.build-state/checkpoint.bin`: capture, save, load, discard.
#[derive(Debug)]
pub struct CheckpointManager {
    state_dir: PathBuf,
}

impl CheckpointManager {
    /// `root` is the workspace root; state lives under
    /// `<root>/.build-state/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: root.into().join(".build-state"),
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.bin")
    }

    /// Snapshot and persist in one step.
    pub fn save_from_graph(&self, graph: &BuildGraph) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::capture(graph);
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Serialize: magic + version + length-prefixed workspace digest in
    /// the header, bincode body, atomic rename into place.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .context("create_state_dir", self.state_dir.display())?;

        let body = bincode::serialize(checkpoint).map_err(|e| {
            BuildError::new(ErrorCode::CacheSaveFailed, format!("encode checkpoint: {e}"))
        })?;

        let digest = checkpoint.workspace_digest.as_bytes();
        let mut out = Vec::with_capacity(4 + 1 + 4 + digest.len() + body.len());
        out.write_u32::<BigEndian>(CHECKPOINT_MAGIC).expect("vec write");
        out.write_u8(CHECKPOINT_VERSION).expect("vec write");
        out.write_u32::<BigEndian>(digest.len() as u32).expect("vec write");
        out.write_all(digest).expect("vec write");
        out.write_all(&body).expect("vec write");

        let path = self.checkpoint_path();
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, &out).context("write_checkpoint", tmp.display())?;
        fs::rename(&tmp, &path).context("publish_checkpoint", path.display())?;
        tracing::debug!(
            path = %path.display(),
            completed = checkpoint.completed_targets,
            total = checkpoint.total_targets,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint if one exists. A corrupt file is an error;
    /// the caller decides between failing resume and a fresh build.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).context("read_checkpoint", path.display())?;
        let slice: &[u8] = &bytes;
        let mut cursor = Cursor::new(slice);

        let magic = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("truncated header"))?;
        if magic != CHECKPOINT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = cursor.read_u8().map_err(|_| corrupt("truncated header"))?;
        if version != CHECKPOINT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let digest_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("truncated digest length"))?;
        let mut digest = vec![0u8; digest_len as usize];
        cursor
            .read_exact(&mut digest)
            .map_err(|_| corrupt("truncated digest"))?;
        let header_digest =
            String::from_utf8(digest).map_err(|_| corrupt("digest not utf-8"))?;

        let body = &slice[cursor.position() as usize..];
        let checkpoint: Checkpoint = bincode::deserialize(body)
            .map_err(|e| corrupt(format!("undecodable body: {e}")))?;

        if checkpoint.workspace_digest != header_digest {
            return Err(corrupt("header digest does not match body"));
        }
        Ok(Some(checkpoint))
    }

    /// Discard the checkpoint after a clean termination.
    pub fn discard(&self) {
        let _ = fs::remove_file(self.checkpoint_path());
    }
}

fn corrupt(msg: impl Into<String>) -> BuildError {
    BuildError::new(
        ErrorCode::CacheCorrupted,
        format!("checkpoint: {}", msg.into()),
    )
}
