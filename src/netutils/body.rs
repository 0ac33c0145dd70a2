//! Replayable request body buffer.
//!
//! Failover needs to send the exact same body to every endpoint it tries, so
//! the inbound body is captured fully before the first attempt. Bodies up to
//! the memory limit stay in memory; anything beyond that is spilled to a
//! temp file that is removed when the buffer is dropped, on every exit path.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody;
use hyper::Body;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{GantryError, GantryResult};

/// Per-request cap on the in-memory part of the buffer.
pub const DEFAULT_MEMORY_BUFFER_LIMIT: usize = 1024 * 1024 * 1024;

const SPILL_READ_CHUNK: usize = 64 * 1024;

struct SpillFile {
    file: NamedTempFile,
    size: u64,
}

/// Fully captured request body: an in-memory prefix plus an optional
/// spilled-to-disk suffix. Write once, replay many times.
pub struct BufferedBody {
    mem: Bytes,
    spill: Option<Arc<SpillFile>>,
}

impl BufferedBody {
    /// Drains `body` completely, keeping up to [`DEFAULT_MEMORY_BUFFER_LIMIT`]
    /// bytes in memory.
    pub async fn new(body: Body) -> GantryResult<Self> {
        Self::with_memory_limit(body, DEFAULT_MEMORY_BUFFER_LIMIT).await
    }

    pub async fn with_memory_limit(mut body: Body, limit: usize) -> GantryResult<Self> {
        let mut mem = BytesMut::new();
        let mut spill: Option<(tokio::fs::File, NamedTempFile, u64)> = None;

        while let Some(chunk) = body.data().await {
            let chunk =
                chunk.map_err(|e| GantryError::body_read(format!("failed to read body: {}", e)))?;
            match spill.as_mut() {
                None if mem.len() + chunk.len() <= limit => {
                    mem.extend_from_slice(&chunk);
                }
                None => {
                    // Crossed the memory limit mid-chunk: keep the prefix in
                    // memory, the rest of this chunk starts the spill file.
                    let room = limit - mem.len();
                    mem.extend_from_slice(&chunk[..room]);

                    let tmp = NamedTempFile::new().map_err(|e| {
                        GantryError::body_read(format!("failed to create spill file: {}", e))
                    })?;
                    let reopened = tmp.reopen().map_err(|e| {
                        GantryError::body_read(format!("failed to open spill file: {}", e))
                    })?;
                    let mut file = tokio::fs::File::from_std(reopened);
                    file.write_all(&chunk[room..]).await.map_err(|e| {
                        GantryError::body_read(format!("failed to spill body: {}", e))
                    })?;
                    debug!("request body exceeds {} bytes, spilling to disk", limit);
                    spill = Some((file, tmp, (chunk.len() - room) as u64));
                }
                Some((file, _, size)) => {
                    file.write_all(&chunk).await.map_err(|e| {
                        GantryError::body_read(format!("failed to spill body: {}", e))
                    })?;
                    *size += chunk.len() as u64;
                }
            }
        }

        let spill = match spill {
            Some((mut file, tmp, size)) => {
                file.flush()
                    .await
                    .map_err(|e| GantryError::body_read(format!("failed to flush spill: {}", e)))?;
                Some(Arc::new(SpillFile { file: tmp, size }))
            }
            None => None,
        };

        Ok(Self {
            mem: mem.freeze(),
            spill,
        })
    }

    /// Total captured length: in-memory prefix plus spill file size.
    pub fn total_size(&self) -> u64 {
        self.mem.len() as u64 + self.spill.as_ref().map(|s| s.size).unwrap_or(0)
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Produces a fresh body positioned at the start of the captured bytes.
    /// Each call is an independent reader, so retried attempts stream
    /// byte-identical bodies.
    pub fn replay(&self) -> Body {
        let spill = match &self.spill {
            None => return Body::from(self.mem.clone()),
            Some(spill) => Arc::clone(spill),
        };

        let mem = self.mem.clone();
        let (mut tx, body) = Body::channel();
        tokio::spawn(async move {
            if !mem.is_empty() && tx.send_data(mem).await.is_err() {
                return;
            }
            // Reopen for an independent read offset; the Arc keeps the temp
            // file alive until this reader is done.
            let reopened = match spill.file.reopen() {
                Ok(f) => f,
                Err(_) => {
                    tx.abort();
                    return;
                }
            };
            let mut file = tokio::fs::File::from_std(reopened);
            let mut buf = vec![0u8; SPILL_READ_CHUNK];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send_data(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        tx.abort();
                        return;
                    }
                }
            }
        });
        body
    }
}

impl std::fmt::Debug for BufferedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedBody")
            .field("mem_len", &self.mem.len())
            .field("spilled", &self.is_spilled())
            .field("total_size", &self.total_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(body: Body) -> Vec<u8> {
        hyper::body::to_bytes(body).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_small_body_stays_in_memory() {
        let body = Body::from("hello world");
        let buffered = BufferedBody::new(body).await.unwrap();
        assert!(!buffered.is_spilled());
        assert_eq!(buffered.total_size(), 11);
        assert_eq!(read_all(buffered.replay()).await, b"hello world");
    }

    #[tokio::test]
    async fn test_large_body_spills_to_disk() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let body = Body::from(payload.clone());
        let buffered = BufferedBody::with_memory_limit(body, 1024).await.unwrap();
        assert!(buffered.is_spilled());
        assert_eq!(buffered.total_size(), payload.len() as u64);
        assert_eq!(read_all(buffered.replay()).await, payload);
    }

    #[tokio::test]
    async fn test_replay_is_repeatable() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let buffered = BufferedBody::with_memory_limit(Body::from(payload.clone()), 100)
            .await
            .unwrap();

        // Several sequential replays see identical bytes
        for _ in 0..3 {
            assert_eq!(read_all(buffered.replay()).await, payload);
        }
    }

    #[tokio::test]
    async fn test_empty_body() {
        let buffered = BufferedBody::new(Body::empty()).await.unwrap();
        assert_eq!(buffered.total_size(), 0);
        assert!(read_all(buffered.replay()).await.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_split_at_limit_boundary() {
        // One chunk that straddles the limit exactly
        let payload = vec![7u8; 150];
        let buffered = BufferedBody::with_memory_limit(Body::from(payload.clone()), 100)
            .await
            .unwrap();
        assert!(buffered.is_spilled());
        assert_eq!(buffered.total_size(), 150);
        assert_eq!(read_all(buffered.replay()).await, payload);
    }
}
