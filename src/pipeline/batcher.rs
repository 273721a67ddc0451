//! Outbound message batching
//!
//! Messages accumulate until the batch is full, an urgent message arrives, or the wait window
//! expires. The batcher only decides *when* to flush; the caller owns the timer and the wire.
//! [`MessageBatcher::flush_into`] hands a batch to a [`BatchSink`] and puts the exact message set
//! back at the front of the pending list if the send fails.

use crate::error::MeshResult;
use crate::protocol::{now_millis, Batch, CompressionType, Message, MessagePriority};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Batches smaller than this are not worth compressing
pub const COMPRESSION_HINT_MIN_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Messages strictly above this priority flush the batch immediately
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: MessagePriority,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size() -> usize {
    10
}

fn default_max_wait_ms() -> u64 {
    100
}

fn default_priority_threshold() -> MessagePriority {
    MessagePriority::High
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size: default_max_size(),
            max_wait_ms: default_max_wait_ms(),
            priority_threshold: default_priority_threshold(),
        }
    }
}

/// Destination for formed batches
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send_batch(&self, batch: &Batch) -> MeshResult<()>;
}

/// What the caller should do after adding a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Flush now
    Flush,
    /// Flush at `deadline`; `arm_timer` is true only for the message that opened the window
    Wait { deadline: Instant, arm_timer: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherStats {
    pub enabled: bool,
    pub pending: usize,
    pub max_size: usize,
    pub max_wait_ms: u64,
    pub priority_threshold: MessagePriority,
    pub batches_created: u64,
}

#[derive(Debug)]
pub struct MessageBatcher {
    config: BatchingConfig,
    pending: VecDeque<Message>,
    batch_counter: u64,
    deadline: Option<Instant>,
}

impl MessageBatcher {
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            batch_counter: 0,
            deadline: None,
        }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Add a message and report whether the batch should go out now
    pub fn add(&mut self, message: Message) -> BatchDecision {
        self.pending.push_back(message);

        if !self.config.enabled || self.should_flush() {
            return BatchDecision::Flush;
        }

        match self.deadline {
            Some(deadline) => BatchDecision::Wait {
                deadline,
                arm_timer: false,
            },
            None => {
                let deadline = Instant::now() + Duration::from_millis(self.config.max_wait_ms);
                self.deadline = Some(deadline);
                BatchDecision::Wait {
                    deadline,
                    arm_timer: true,
                }
            }
        }
    }

    /// Size or urgency trigger reached
    pub fn should_flush(&self) -> bool {
        self.pending.len() >= self.config.max_size.max(1)
            || self
                .pending
                .iter()
                .any(|m| m.priority() > self.config.priority_threshold)
    }

    /// Deadline of the open wait window, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Form the next batch from pending messages
    ///
    /// Takes at most `max_size` messages when batching is enabled, one message otherwise.
    pub fn take_batch(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            self.deadline = None;
            return None;
        }

        let limit = if self.config.enabled {
            self.config.max_size.max(1)
        } else {
            1
        };
        let count = limit.min(self.pending.len());
        let messages: Vec<Message> = self.pending.drain(..count).collect();
        if self.pending.is_empty() {
            self.deadline = None;
        }

        self.batch_counter += 1;
        let mut batch = Batch::from_messages(self.next_batch_id(), messages);
        batch.compression = Some(Self::compression_hint(&batch));

        debug!(
            batch_id = %batch.id,
            messages = batch.metadata.message_count,
            total_size = batch.metadata.total_size,
            priority = ?batch.metadata.priority,
            "batch formed"
        );
        Some(batch)
    }

    /// Put messages back at the front, preserving their order
    pub fn requeue_front(&mut self, messages: Vec<Message>) {
        for message in messages.into_iter().rev() {
            self.pending.push_front(message);
        }
    }

    /// Send every pending message through `sink`, one batch at a time
    ///
    /// On failure the failed batch's messages are back at the front of the pending list and the
    /// error is returned. Returns the number of batches sent.
    pub async fn flush_into<S: BatchSink + ?Sized>(&mut self, sink: &S) -> MeshResult<usize> {
        let mut sent = 0;
        while let Some(batch) = self.take_batch() {
            if let Err(e) = sink.send_batch(&batch).await {
                warn!(
                    batch_id = %batch.id,
                    messages = batch.messages.len(),
                    "batch send failed, re-queueing: {}",
                    e
                );
                self.requeue_front(batch.messages);
                return Err(e);
            }
            sent += 1;
        }
        Ok(sent)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            enabled: self.config.enabled,
            pending: self.pending.len(),
            max_size: self.config.max_size,
            max_wait_ms: self.config.max_wait_ms,
            priority_threshold: self.config.priority_threshold,
            batches_created: self.batch_counter,
        }
    }

    /// Apply a new config. Returns true when pending messages should be flushed now.
    pub fn update_config(&mut self, config: BatchingConfig) -> bool {
        self.config = config;
        !self.pending.is_empty() && (!self.config.enabled || self.should_flush())
    }

    /// Drop all pending messages, returning them
    pub fn clear(&mut self) -> Vec<Message> {
        self.deadline = None;
        self.pending.drain(..).collect()
    }

    fn next_batch_id(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("batch_{}_{}_{}", now_millis(), self.batch_counter, suffix)
    }

    /// Small batches and batches with a member opting out of compression stay uncompressed
    fn compression_hint(batch: &Batch) -> CompressionType {
        if batch.metadata.total_size < COMPRESSION_HINT_MIN_SIZE {
            return CompressionType::None;
        }
        let opted_out = batch
            .messages
            .iter()
            .any(|m| m.optimization.compression == Some(CompressionType::None));
        if opted_out {
            CompressionType::None
        } else {
            CompressionType::Gzip
        }
    }
}
