//! Sample payload compression
//!
//! Columns are written to the data file as self-contained blocks:
//! 1. Integer columns are delta-encoded (successive differences)
//! 2. The encoded column is serialized with bincode
//! 3. The result is LZ4 compressed with the uncompressed size prepended

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Samples;
use serde::{Deserialize, Serialize};

/// On-disk form of a sample column
#[derive(Debug, Serialize, Deserialize)]
enum EncodedColumn {
    Float64(Vec<f64>),
    /// First value followed by wrapping differences
    Int64 { base: i64, deltas: Vec<i64> },
    Bytes(Vec<Vec<u8>>),
}

impl EncodedColumn {
    fn encode(samples: &Samples) -> Self {
        match samples {
            Samples::Float64(values) => EncodedColumn::Float64(values.clone()),
            Samples::Int64(values) => {
                let base = values.first().copied().unwrap_or(0);
                let deltas = values
                    .windows(2)
                    .map(|w| w[1].wrapping_sub(w[0]))
                    .collect();
                EncodedColumn::Int64 { base, deltas }
            }
            Samples::Bytes(values) => EncodedColumn::Bytes(values.clone()),
        }
    }

    fn decode(self, len: usize) -> Samples {
        match self {
            EncodedColumn::Float64(values) => Samples::Float64(values),
            EncodedColumn::Int64 { base, deltas } => {
                let mut values = Vec::with_capacity(len);
                if len > 0 {
                    let mut current = base;
                    values.push(current);
                    for delta in deltas {
                        current = current.wrapping_add(delta);
                        values.push(current);
                    }
                }
                Samples::Int64(values)
            }
            EncodedColumn::Bytes(values) => Samples::Bytes(values),
        }
    }
}

/// Compress one sample column into a data-file block.
pub fn compress_samples(samples: &Samples) -> StorageResult<Vec<u8>> {
    let serialized = bincode::serialize(&EncodedColumn::encode(samples))
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress a block written by [`compress_samples`]; `len` is the expected sample count.
pub fn decompress_samples(data: &[u8], len: usize) -> StorageResult<Samples> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let column: EncodedColumn = bincode::deserialize(&decompressed)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let samples = column.decode(len);
    if samples.len() != len {
        return Err(StorageError::Compression(format!(
            "expected {} samples, block holds {}",
            len,
            samples.len()
        )));
    }
    Ok(samples)
}

/// Compression statistics for a block
#[derive(Debug)]
pub struct CompressionStats {
    pub sample_count: usize,
    /// In-memory size (bytes)
    pub original_size: usize,
    /// Compressed size (bytes)
    pub compressed_size: usize,
    /// original / compressed
    pub ratio: f64,
}

pub fn compression_stats(samples: &Samples, compressed: &[u8]) -> CompressionStats {
    let original_size = samples.estimated_size();
    let compressed_size = compressed.len();
    let ratio = if compressed_size > 0 {
        original_size as f64 / compressed_size as f64
    } else {
        0.0
    };

    CompressionStats {
        sample_count: samples.len(),
        original_size,
        compressed_size,
        ratio,
    }
}
