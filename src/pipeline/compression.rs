//! Stateless compression codec
//!
//! Gzip is backed by `flate2` (miniz_oxide backend) and Brotli by `brotli`. `none` is a
//! passthrough in both directions.

use crate::error::{MeshError, MeshResult};
use crate::protocol::CompressionType;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Algorithms this build can encode and decode, in preference order
pub const SUPPORTED_ALGORITHMS: [CompressionType; 2] =
    [CompressionType::Gzip, CompressionType::Brotli];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Candidate algorithms in declaration order (ties go to the earlier one)
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<CompressionType>,
    /// Payloads smaller than this many bytes are never compressed
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_level")]
    pub level: u32,
    /// Largest payload a compressed input may inflate to
    #[serde(default = "default_max_decompressed_size")]
    pub max_decompressed_size: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_algorithms() -> Vec<CompressionType> {
    SUPPORTED_ALGORITHMS.to_vec()
}

fn default_threshold() -> usize {
    1024
}

fn default_level() -> u32 {
    6
}

fn default_max_decompressed_size() -> usize {
    256 * 1024
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            algorithms: default_algorithms(),
            threshold: default_threshold(),
            level: default_level(),
            max_decompressed_size: default_max_decompressed_size(),
        }
    }
}

/// Byte-level codec shared by single messages and batches
#[derive(Debug, Clone, Default)]
pub struct CompressionCodec {
    config: CompressionConfig,
}

impl CompressionCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: CompressionConfig) {
        self.config = config;
    }

    /// Compress with the given algorithm. Disabled codecs and `none` return the input unchanged.
    pub fn compress(&self, data: &[u8], algorithm: CompressionType) -> MeshResult<Vec<u8>> {
        if !self.config.enabled {
            return Ok(data.to_vec());
        }

        match algorithm {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Gzip => self.gzip(data),
            CompressionType::Brotli => self.brotli(data),
        }
    }

    /// Decompress with the given algorithm
    ///
    /// Decoding ignores the `enabled` flag: a peer may compress even when this side does not.
    /// Output larger than `max_decompressed_size` is a protocol error.
    pub fn decompress(&self, data: &[u8], algorithm: CompressionType) -> MeshResult<Vec<u8>> {
        match algorithm {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Gzip => self.inflate(GzDecoder::new(data), "gzip"),
            CompressionType::Brotli => {
                self.inflate(brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE), "brotli")
            }
        }
    }

    fn inflate(&self, decoder: impl Read, name: &str) -> MeshResult<Vec<u8>> {
        let limit = self.config.max_decompressed_size;
        let mut out = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| MeshError::compression(format!("{name} decode failed: {e}")))?;
        if out.len() > limit {
            return Err(MeshError::protocol(format!(
                "{name} payload inflates beyond the {limit} byte limit"
            )));
        }
        Ok(out)
    }

    /// Whether the payload is large enough to be worth compressing
    pub fn should_compress(&self, data: &[u8]) -> bool {
        self.config.enabled && data.len() >= self.config.threshold
    }

    /// Pick the algorithm that yields the smallest output for `data`
    ///
    /// Returns `none` when the codec is disabled, the data is below threshold, or no algorithm is
    /// configured. A single candidate is used without measuring.
    pub fn select_best_algorithm(
        &self,
        data: &[u8],
        candidates: &[CompressionType],
    ) -> CompressionType {
        if !self.should_compress(data) || self.config.algorithms.is_empty() {
            return CompressionType::None;
        }

        let mut available: Vec<CompressionType> = Vec::new();
        for candidate in candidates {
            if *candidate != CompressionType::None && !available.contains(candidate) {
                available.push(*candidate);
            }
        }

        match available.as_slice() {
            [] => CompressionType::None,
            [only] => *only,
            _ => {
                let mut best: Option<(CompressionType, usize)> = None;
                for algorithm in available {
                    match self.compress(data, algorithm) {
                        Ok(compressed) => {
                            let size = compressed.len();
                            debug!(
                                algorithm = algorithm.as_str(),
                                original = data.len(),
                                compressed = size,
                                "measured compression candidate"
                            );
                            // Strict comparison keeps the earlier candidate on ties
                            if best.map_or(true, |(_, best_size)| size < best_size) {
                                best = Some((algorithm, size));
                            }
                        }
                        Err(e) => debug!("skipping {}: {}", algorithm.as_str(), e),
                    }
                }
                best.map_or(CompressionType::None, |(algorithm, _)| algorithm)
            }
        }
    }

    /// [`CompressionCodec::select_best_algorithm`] over the configured algorithms
    pub fn best_algorithm(&self, data: &[u8]) -> CompressionType {
        let configured: Vec<CompressionType> = self
            .config
            .algorithms
            .iter()
            .copied()
            .filter(|a| SUPPORTED_ALGORITHMS.contains(a))
            .collect();
        self.select_best_algorithm(data, &configured)
    }

    /// Compressed size over original size; 1.0 for empty input
    pub fn compression_ratio(original_len: usize, compressed_len: usize) -> f64 {
        if original_len == 0 {
            return 1.0;
        }
        compressed_len as f64 / original_len as f64
    }

    fn gzip(&self, data: &[u8]) -> MeshResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.config.level.min(9)));
        encoder
            .write_all(data)
            .map_err(|e| MeshError::compression(format!("gzip encode failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| MeshError::compression(format!("gzip encode failed: {e}")))
    }

    fn brotli(&self, data: &[u8]) -> MeshResult<Vec<u8>> {
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.config.level.min(11) as i32,
            ..Default::default()
        };
        let mut out = Vec::new();
        brotli::BrotliCompress(&mut &data[..], &mut out, &params)
            .map_err(|e| MeshError::compression(format!("brotli encode failed: {e}")))?;
        Ok(out)
    }
}
