//! Batch wire framing
//!
//! A batch whose hint allows compression is encoded by compressing the JSON array of its
//! messages with the codec's best algorithm. The compressed form is only used when it saves at
//! least 10%; it then travels base64 encoded in `data` with an empty `messages` array.

use super::compression::CompressionCodec;
use crate::error::{MeshError, MeshResult};
use crate::protocol::{Batch, CompressionType, Message};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::debug;

/// Compressed output must be at most this fraction of the original to be worth sending
pub const MAX_USEFUL_RATIO: f64 = 0.9;

/// A batch ready for the wire
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub frame: Vec<u8>,
    pub compression: CompressionType,
    pub original_len: usize,
    pub compressed_len: Option<usize>,
}

/// Serialize a batch, compressing its message array when worthwhile
pub fn encode_batch(batch: &Batch, codec: &CompressionCodec) -> MeshResult<EncodedBatch> {
    let wants_compression = matches!(
        batch.compression,
        Some(CompressionType::Gzip) | Some(CompressionType::Brotli)
    );

    if wants_compression && !batch.messages.is_empty() {
        let body = serde_json::to_vec(&batch.messages)?;
        let algorithm = codec.best_algorithm(&body);

        if algorithm != CompressionType::None {
            let compressed = codec.compress(&body, algorithm)?;
            let ratio = CompressionCodec::compression_ratio(body.len(), compressed.len());

            if ratio <= MAX_USEFUL_RATIO {
                let wire = Batch {
                    compression: Some(algorithm),
                    messages: Vec::new(),
                    data: Some(STANDARD.encode(&compressed)),
                    ..batch.clone()
                };
                debug!(
                    batch_id = %batch.id,
                    algorithm = algorithm.as_str(),
                    original = body.len(),
                    compressed = compressed.len(),
                    "batch compressed"
                );
                return Ok(EncodedBatch {
                    frame: serde_json::to_vec(&wire)?,
                    compression: algorithm,
                    original_len: body.len(),
                    compressed_len: Some(compressed.len()),
                });
            }
            debug!(batch_id = %batch.id, ratio, "compression not worthwhile, sending plain");
        }
    }

    let plain = Batch {
        compression: Some(CompressionType::None),
        data: None,
        ..batch.clone()
    };
    let frame = serde_json::to_vec(&plain)?;
    Ok(EncodedBatch {
        original_len: frame.len(),
        frame,
        compression: CompressionType::None,
        compressed_len: None,
    })
}

/// Recover the member messages of an inbound batch
pub fn expand_batch(batch: &Batch, codec: &CompressionCodec) -> MeshResult<Vec<Message>> {
    let Some(data) = &batch.data else {
        return Ok(batch.messages.clone());
    };

    let algorithm = batch.compression.unwrap_or(CompressionType::None);
    let compressed = STANDARD
        .decode(data)
        .map_err(|e| MeshError::protocol(format!("batch {} has invalid data: {e}", batch.id)))?;
    let body = codec.decompress(&compressed, algorithm)?;
    serde_json::from_slice(&body).map_err(|e| {
        MeshError::protocol(format!(
            "batch {} decompressed to an invalid message array: {e}",
            batch.id
        ))
    })
}
