//! Content-defined chunking for transfer-efficient artifact delta
//! transport.
//!
//! Large binary outputs are split at rolling-hash boundaries so an edit
//! near the front of a file does not shift every later chunk. The chunker
//! is a pure function of the bytes: same input, same manifest, on any
//! host. Only chunks whose hash the remote does not already have need to
//! be uploaded; the manifest plus the unchanged-chunk blobs reconstruct
//! the file exactly.

use mason_error::{BuildError, ErrorCode, Result};
use serde::{Deserialize, Serialize};

const WINDOW_SIZE: usize = 48;
const MIN_CHUNK: usize = 2 * 1024;
const MAX_CHUNK: usize = 64 * 1024;
/// Boundary mask giving ~8 KiB average chunks.
const BOUNDARY_MASK: u64 = (1 << 13) - 1;

/// One chunk of a chunked artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
    /// blake3 of the chunk bytes, hex.
    pub hash: String,
}

/// Ordered chunk list for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    /// blake3 of the whole file, hex.
    pub file_hash: String,
    pub total_size: u64,
    pub chunks: Vec<Chunk>,
}

/// Rabin-style rolling-hash chunker.
#[derive(Debug, Clone)]
pub struct Chunker {
    min_chunk: usize,
    max_chunk: usize,
    boundary_mask: u64,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            min_chunk: MIN_CHUNK,
            max_chunk: MAX_CHUNK,
            boundary_mask: BOUNDARY_MASK,
        }
    }
}

impl Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small chunk sizes for tests; production uses the defaults.
    pub fn with_bounds(min_chunk: usize, max_chunk: usize, boundary_mask: u64) -> Self {
        Self {
            min_chunk: min_chunk.max(1),
            max_chunk: max_chunk.max(min_chunk.max(1)),
            boundary_mask,
        }
    }

    /// Split `data` at content-defined boundaries.
    pub fn chunk(&self, data: &[u8]) -> ChunkManifest {
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < data.len() {
            let end = self.find_boundary(&data[start..]);
            let chunk = &data[start..start + end];
            chunks.push(Chunk {
                offset: start as u64,
                length: chunk.len() as u64,
                hash: blake3::hash(chunk).to_hex().to_string(),
            });
            start += end;
        }

        ChunkManifest {
            file_hash: blake3::hash(data).to_hex().to_string(),
            total_size: data.len() as u64,
            chunks,
        }
    }

    /// Length of the next chunk starting at `data[0]`.
    fn find_boundary(&self, data: &[u8]) -> usize {
        if data.len() <= self.min_chunk {
            return data.len();
        }
        let limit = data.len().min(self.max_chunk);
        let mut hash: u64 = 0;
        for (i, &byte) in data[..limit].iter().enumerate() {
            hash = hash
                .wrapping_mul(31)
                .wrapping_add(u64::from(byte))
                .wrapping_sub(if i >= WINDOW_SIZE {
                    // Slide the window: retire the oldest byte's term.
                    u64::from(data[i - WINDOW_SIZE]).wrapping_mul(POW31_WINDOW)
                } else {
                    0
                });
            if i >= self.min_chunk && (hash & self.boundary_mask) == self.boundary_mask {
                return i + 1;
            }
        }
        limit
    }
}

/// 31^WINDOW_SIZE mod 2^64, precomputed for the rolling window.
const POW31_WINDOW: u64 = pow31(WINDOW_SIZE as u32);

const fn pow31(mut n: u32) -> u64 {
    let mut acc: u64 = 1;
    while n > 0 {
        acc = acc.wrapping_mul(31);
        n -= 1;
    }
    acc
}

/// Rebuild a file from its manifest, fetching chunk bytes by hash.
///
/// Verifies both per-chunk hashes and the whole-file hash; any mismatch
/// is `CacheCorrupted`.
pub fn reconstruct(
    manifest: &ChunkManifest,
    mut fetch: impl FnMut(&str) -> Option<Vec<u8>>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(manifest.total_size as usize);
    for chunk in &manifest.chunks {
        let bytes = fetch(&chunk.hash).ok_or_else(|| {
            BuildError::new(
                ErrorCode::CacheCorrupted,
                format!("missing chunk {} at offset {}", chunk.hash, chunk.offset),
            )
        })?;
        if blake3::hash(&bytes).to_hex().to_string() != chunk.hash {
            return Err(BuildError::new(
                ErrorCode::CacheCorrupted,
                format!("chunk {} content mismatch", chunk.hash),
            ));
        }
        out.extend_from_slice(&bytes);
    }
    if blake3::hash(&out).to_hex().to_string() != manifest.file_hash {
        return Err(BuildError::new(
            ErrorCode::CacheCorrupted,
            "reconstructed file hash mismatch",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_chunker() -> Chunker {
        Chunker::with_bounds(64, 1024, (1 << 6) - 1)
    }

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        // Deterministic xorshift filler so chunk boundaries are stable.
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_chunking_is_pure() {
        let data = pseudo_random(32 * 1024, 7);
        let chunker = test_chunker();
        assert_eq!(chunker.chunk(&data), chunker.chunk(&data));
    }

    #[test]
    fn test_chunks_tile_the_file() {
        let data = pseudo_random(20_000, 11);
        let manifest = test_chunker().chunk(&data);
        let mut expected_offset = 0u64;
        for chunk in &manifest.chunks {
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.length;
        }
        assert_eq!(expected_offset, manifest.total_size);
    }

    #[test]
    fn test_reconstruct_round_trip() {
        let data = pseudo_random(16 * 1024, 3);
        let manifest = test_chunker().chunk(&data);

        let blobs: HashMap<String, Vec<u8>> = manifest
            .chunks
            .iter()
            .map(|c| {
                let bytes =
                    data[c.offset as usize..(c.offset + c.length) as usize].to_vec();
                (c.hash.clone(), bytes)
            })
            .collect();

        let rebuilt = reconstruct(&manifest, |hash| blobs.get(hash).cloned()).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_local_edit_preserves_most_chunks() {
        let mut data = pseudo_random(64 * 1024, 5);
        let chunker = test_chunker();
        let before = chunker.chunk(&data);
        data[100] ^= 0xFF;
        let after = chunker.chunk(&data);

        let before_hashes: std::collections::HashSet<&String> =
            before.chunks.iter().map(|c| &c.hash).collect();
        let unchanged = after
            .chunks
            .iter()
            .filter(|c| before_hashes.contains(&c.hash))
            .count();
        // An edit at the front must not shift every later boundary.
        assert!(
            unchanged * 2 > after.chunks.len(),
            "only {}/{} chunks survived a 1-byte edit",
            unchanged,
            after.chunks.len()
        );
    }

    #[test]
    fn test_missing_chunk_is_corruption() {
        let data = pseudo_random(8 * 1024, 9);
        let manifest = test_chunker().chunk(&data);
        let err = reconstruct(&manifest, |_| None).unwrap_err();
        assert_eq!(err.code(), mason_error::ErrorCode::CacheCorrupted);
    }

    #[test]
    fn test_empty_input() {
        let manifest = test_chunker().chunk(&[]);
        assert!(manifest.chunks.is_empty());
        assert_eq!(manifest.total_size, 0);
        assert_eq!(reconstruct(&manifest, |_| None).unwrap(), Vec::<u8>::new());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunk_then_reconstruct_is_identity(data in prop::collection::vec(any::<u8>(), 0..16_384)) {
                let manifest = test_chunker().chunk(&data);
                let blobs: HashMap<String, Vec<u8>> = manifest
                    .chunks
                    .iter()
                    .map(|c| {
                        let bytes =
                            data[c.offset as usize..(c.offset + c.length) as usize].to_vec();
                        (c.hash.clone(), bytes)
                    })
                    .collect();
                let rebuilt = reconstruct(&manifest, |hash| blobs.get(hash).cloned()).unwrap();
                prop_assert_eq!(rebuilt, data);
            }

            #[test]
            fn chunks_always_tile(data in prop::collection::vec(any::<u8>(), 0..16_384)) {
                let manifest = test_chunker().chunk(&data);
                let mut offset = 0u64;
                for chunk in &manifest.chunks {
                    prop_assert_eq!(chunk.offset, offset);
                    prop_assert!(chunk.length > 0);
                    offset += chunk.length;
                }
                prop_assert_eq!(offset, data.len() as u64);
            }
        }
    }
}
