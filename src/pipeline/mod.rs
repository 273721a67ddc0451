//! Outbound delivery pipeline
//!
//! Messages flow through the offline [`queue`] while the link is down, are grouped by the
//! [`batcher`] and squeezed by the [`compression`] codec before [`framing`] turns them into wire
//! frames.

pub mod batcher;
pub mod compression;
pub mod framing;
pub mod queue;

pub use batcher::{BatchDecision, BatchSink, BatcherStats, BatchingConfig, MessageBatcher};
pub use compression::{CompressionCodec, CompressionConfig, SUPPORTED_ALGORITHMS};
pub use framing::{encode_batch, expand_batch, EncodedBatch};
pub use queue::{MessageQueue, QueueConfig, QueueStats, QueuedMessage};
