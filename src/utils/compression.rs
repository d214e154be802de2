//! gzip chunk compression.
//!
//! A chunk is only sent compressed when that saves at least 10% of its
//! length; otherwise the original bytes travel unchanged.

use crate::core::config::COMPRESSION_KEEP_RATIO;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Read;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decompressed chunk exceeds {0} bytes")]
    TooLarge(usize),
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut out = Vec::with_capacity(data.len() / 2);
    encoder
        .read_to_end(&mut out)
        .map_err(CompressionError::Compress)?;
    Ok(out)
}

/// Compress `chunk` and return the result only if it is at least 10% smaller.
pub fn compress_if_smaller(chunk: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
    if chunk.is_empty() {
        return Ok(None);
    }
    let compressed = compress(chunk)?;
    if (compressed.len() as f64) <= chunk.len() as f64 * COMPRESSION_KEEP_RATIO {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompress a gzip stream, refusing output larger than `limit` bytes.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
    let decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CompressionError::Decompress)?;
    if out.len() > limit {
        return Err(CompressionError::TooLarge(limit));
    }
    Ok(out)
}
