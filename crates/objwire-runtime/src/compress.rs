//! Whole-message compression.
//!
//! A compressed message keeps its 14-byte header (compression status 2, size
//! of the compressed message), followed by the i32 size of the uncompressed
//! message and the LZ4 block of everything after the header.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::protocol::{CompressionStatus, COMPRESSION_OFFSET, COMPRESSION_THRESHOLD, HEADER_SIZE, SIZE_OFFSET};

/// Statistics for compression operations.
#[derive(Debug, Default)]
struct CompressionStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    compressions: AtomicU64,
    decompressions: AtomicU64,
    skipped: AtomicU64,
}

/// Snapshot of compression statistics.
#[derive(Debug, Clone, Default)]
pub struct CompressionStatsSnapshot {
    /// Bytes of messages offered for compression.
    pub bytes_in: u64,
    /// Bytes of the compressed messages produced.
    pub bytes_out: u64,
    /// Messages compressed.
    pub compressions: u64,
    /// Messages decompressed.
    pub decompressions: u64,
    /// Messages left uncompressed (too small, or no gain).
    pub skipped: u64,
}

/// Message compressor; `enabled` is the communicator's capability flag.
#[derive(Debug)]
pub struct MessageCompressor {
    enabled: bool,
    stats: CompressionStats,
}

impl MessageCompressor {
    /// Creates a compressor. A disabled compressor never compresses and
    /// rejects compressed input.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stats: CompressionStats::default(),
        }
    }

    /// Whether compression is available.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Compresses a framed message, or returns `None` when it should go out as is.
    pub fn compress(&self, msg: &[u8]) -> Option<Bytes> {
        if !self.enabled || msg.len() < COMPRESSION_THRESHOLD {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats
            .bytes_in
            .fetch_add(msg.len() as u64, Ordering::Relaxed);

        let body = lz4_flex::block::compress(&msg[HEADER_SIZE..]);
        let total = HEADER_SIZE + 4 + body.len();
        if total >= msg.len() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let (Ok(total_i32), Ok(original_i32)) = (i32::try_from(total), i32::try_from(msg.len())) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&msg[..HEADER_SIZE]);
        out[COMPRESSION_OFFSET] = CompressionStatus::Compressed as u8;
        out[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&total_i32.to_le_bytes());
        out.extend_from_slice(&original_i32.to_le_bytes());
        out.extend_from_slice(&body);

        self.stats
            .bytes_out
            .fetch_add(total as u64, Ordering::Relaxed);
        self.stats.compressions.fetch_add(1, Ordering::Relaxed);
        Some(Bytes::from(out))
    }

    /// Restores a compressed message to its uncompressed framing.
    ///
    /// The header keeps compression status 2 so the receiver knows the peer
    /// can accept a compressed reply.
    pub fn decompress(&self, msg: &[u8], message_size_max: usize) -> Result<Bytes> {
        if !self.enabled {
            return Err(RpcError::Compression {
                reason: "received a compressed message but compression is disabled".to_string(),
            });
        }
        if msg.len() < HEADER_SIZE + 4 {
            return Err(RpcError::IllegalMessageSize { size: msg.len() as i32 });
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&msg[HEADER_SIZE..HEADER_SIZE + 4]);
        let original = i32::from_le_bytes(raw);
        if original <= HEADER_SIZE as i32 {
            return Err(RpcError::IllegalMessageSize { size: original });
        }
        let original = original as usize;
        if message_size_max > 0 && original > message_size_max {
            return Err(RpcError::MessageSizeExceeded {
                size: original,
                max: message_size_max,
            });
        }

        let body = lz4_flex::block::decompress(&msg[HEADER_SIZE + 4..], original - HEADER_SIZE)
            .map_err(|e| RpcError::Compression {
                reason: e.to_string(),
            })?;

        let mut out = Vec::with_capacity(original);
        out.extend_from_slice(&msg[..HEADER_SIZE]);
        out[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&(original as i32).to_le_bytes());
        out.extend_from_slice(&body);
        self.stats.decompressions.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::from(out))
    }

    /// Get a snapshot of current compression statistics.
    pub fn stats(&self) -> CompressionStatsSnapshot {
        CompressionStatsSnapshot {
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            compressions: self.stats.compressions.load(Ordering::Relaxed),
            decompressions: self.stats.decompressions.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
        }
    }
}
