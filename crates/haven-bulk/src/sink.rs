/// Materialize/verify hooks run over each freshly pulled chunk.
///
/// The engine never interprets payload bytes. A [`ChunkSink`] sees every
/// delivered range exactly once, while the session lock is held, and can
/// fail the transfer by returning an error.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::SinkError;
use crate::planner::ChunkDescriptor;
use crate::session::SessionId;

pub trait ChunkSink: Send + Sync {
    fn materialize(
        &self,
        session: SessionId,
        chunk: ChunkDescriptor,
        bytes: &[u8],
    ) -> Result<(), SinkError>;
}

/// Accepts everything.
pub struct NullSink;

impl ChunkSink for NullSink {
    fn materialize(&self, _: SessionId, _: ChunkDescriptor, _: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Byte expected at absolute position `position` of a pattern payload.
#[inline]
pub fn pattern_byte(position: u64) -> u8 {
    (position % 256) as u8
}

/// Build a pattern payload of `len` bytes.
pub fn pattern_payload(len: usize) -> Vec<u8> {
    (0..len as u64).map(pattern_byte).collect()
}

/// Checks that every byte equals its absolute position modulo 256.
pub struct PatternVerifier;

impl ChunkSink for PatternVerifier {
    fn materialize(
        &self,
        _: SessionId,
        chunk: ChunkDescriptor,
        bytes: &[u8],
    ) -> Result<(), SinkError> {
        for (i, &actual) in bytes.iter().enumerate() {
            let position = chunk.offset + i as u64;
            let expected = pattern_byte(position);
            if actual != expected {
                return Err(SinkError::PatternMismatch {
                    position,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verifies each chunk against a precomputed per-chunk SHA-256 list.
pub struct DigestVerifier {
    chunk_size: u64,
    chunk_hashes: Vec<String>,
}

impl DigestVerifier {
    pub fn new(chunk_size: u64, chunk_hashes: Vec<String>) -> Self {
        Self {
            chunk_size,
            chunk_hashes,
        }
    }

    /// Hash `payload` the way the verifier expects it, chunk by chunk.
    pub fn for_payload(payload: &[u8], chunk_size: u64) -> Self {
        let hashes = payload
            .chunks(chunk_size.max(1) as usize)
            .map(sha256_hex)
            .collect();
        Self::new(chunk_size, hashes)
    }
}

impl ChunkSink for DigestVerifier {
    fn materialize(
        &self,
        _: SessionId,
        chunk: ChunkDescriptor,
        bytes: &[u8],
    ) -> Result<(), SinkError> {
        let index = (chunk.offset / self.chunk_size.max(1)) as usize;
        let expected = self
            .chunk_hashes
            .get(index)
            .ok_or(SinkError::MissingDigest(chunk.offset))?;
        let actual = sha256_hex(bytes);
        if &actual != expected {
            return Err(SinkError::DigestMismatch {
                offset: chunk.offset,
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Writes each chunk at its offset in a preallocated file.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    /// Create (or truncate) `path` and size it to `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ChunkSink for FileSink {
    fn materialize(
        &self,
        _: SessionId,
        chunk: ChunkDescriptor,
        bytes: &[u8],
    ) -> Result<(), SinkError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(bytes)?;
        Ok(())
    }
}
