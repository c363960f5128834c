//! Payload compression for cached values
//!
//! Large payloads (serialized dataframes, indices) are compressed once when
//! the value envelope is built, so every tier stores the same compressed bytes.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 - Fast compression/decompression
    Lz4,
    /// Zstandard - Better compression ratio
    Zstd,
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Enable compression globally
    pub enabled: bool,
    /// Minimum payload size to compress (bytes)
    pub min_payload_size: usize,
    /// Algorithm used for payloads above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Zstd compression level (1-22)
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_payload_size: 4096,
            algorithm: CompressionAlgorithm::Lz4,
            zstd_level: 3,
        }
    }
}

/// Compresses value payloads according to [`CompressionConfig`]
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress `data` if it qualifies; returns the bytes and the algorithm actually applied
    pub fn compress(
        &self,
        data: Vec<u8>,
    ) -> Result<(Vec<u8>, CompressionAlgorithm), std::io::Error> {
        if !self.should_compress(&data) {
            return Ok((data, CompressionAlgorithm::None));
        }

        let compressed = match self.config.algorithm {
            CompressionAlgorithm::None => return Ok((data, CompressionAlgorithm::None)),
            CompressionAlgorithm::Lz4 => compress_lz4(&data)?,
            CompressionAlgorithm::Zstd => {
                zstd::encode_all(data.as_slice(), self.config.zstd_level)?
            }
        };

        // Incompressible payloads are kept raw
        if compressed.len() >= data.len() {
            debug!(
                "Compression not beneficial ({} -> {} bytes), storing raw",
                data.len(),
                compressed.len()
            );
            return Ok((data, CompressionAlgorithm::None));
        }

        debug!(
            "{:?} compressed: {} -> {} bytes (ratio: {:.2}x)",
            self.config.algorithm,
            data.len(),
            compressed.len(),
            data.len() as f64 / compressed.len() as f64
        );

        Ok((compressed, self.config.algorithm))
    }

    /// Decompress data produced by [`Compressor::compress`]
    pub fn decompress(
        data: &[u8],
        algorithm: CompressionAlgorithm,
    ) -> Result<Vec<u8>, std::io::Error> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => {
                let mut decoder = lz4::Decoder::new(data)?;
                let mut decompressed = Vec::new();
                decoder.read_to_end(&mut decompressed)?;
                Ok(decompressed)
            }
            CompressionAlgorithm::Zstd => zstd::decode_all(data),
        }
    }

    pub fn should_compress(&self, data: &[u8]) -> bool {
        self.config.enabled && data.len() >= self.config.min_payload_size
    }
}

fn compress_lz4(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = lz4::EncoderBuilder::new()
        .level(4) // Fast compression
        .build(Vec::new())?;

    encoder.write_all(data)?;
    let (compressed, result) = encoder.finish();
    result?;

    Ok(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(algorithm: CompressionAlgorithm) -> Compressor {
        Compressor::new(CompressionConfig {
            enabled: true,
            min_payload_size: 10,
            algorithm,
            ..Default::default()
        })
    }

    #[test]
    fn test_lz4_compression() {
        let data = b"Hello, World! This is a test string that should compress well.".repeat(10);
        let (compressed, algo) = compressor(CompressionAlgorithm::Lz4)
            .compress(data.clone())
            .unwrap();

        assert_eq!(algo, CompressionAlgorithm::Lz4);
        assert!(compressed.len() < data.len());
        assert_eq!(Compressor::decompress(&compressed, algo).unwrap(), data);
    }

    #[test]
    fn test_zstd_compression() {
        let data = b"Hello, World! This is a test string that should compress well.".repeat(10);
        let (compressed, algo) = compressor(CompressionAlgorithm::Zstd)
            .compress(data.clone())
            .unwrap();

        assert_eq!(algo, CompressionAlgorithm::Zstd);
        assert_eq!(Compressor::decompress(&compressed, algo).unwrap(), data);
    }

    #[test]
    fn test_small_payload_skipped() {
        let (bytes, algo) = compressor(CompressionAlgorithm::Lz4)
            .compress(b"tiny".to_vec())
            .unwrap();

        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(bytes, b"tiny".to_vec());
    }

    #[test]
    fn test_disabled_by_default() {
        let data = vec![7u8; 100_000];
        let (bytes, algo) = Compressor::default().compress(data.clone()).unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(bytes.len(), data.len());
    }
}
