//! Offline message buffer
//!
//! Holds outbound messages while the link is down. Entries are kept sorted by priority
//! (critical first) and FIFO within a priority. The queue is bounded: when full, the oldest
//! low or normal message is evicted to make room, and if none exists the enqueue fails with an
//! overflow error. Expired entries are purged lazily on every read.

use crate::error::{MeshError, MeshResult};
use crate::protocol::{Message, MessagePriority};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Default time-to-live for buffered messages in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Retry budget exposed to senders that re-buffer messages
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_size() -> usize {
    1000
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            ttl_ms: default_ttl_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// A buffered message with its bookkeeping
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub queued_at: Instant,
    pub attempts: u32,
    /// Expiry deadline; the entry is dropped once this passes
    pub next_retry: Instant,
    pub priority: MessagePriority,
    sequence: u64,
}

impl QueuedMessage {
    fn new(message: Message, default_ttl: Duration, sequence: u64) -> Self {
        let now = Instant::now();
        let ttl = message
            .optimization
            .ttl
            .map(Duration::from_millis)
            .map_or(default_ttl, |message_ttl| message_ttl.min(default_ttl));

        Self {
            priority: message.priority(),
            message,
            queued_at: now,
            attempts: 0,
            next_retry: now + ttl,
            sequence,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.next_retry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_expired: u64,
    pub total_evicted: u64,
    pub oldest_message_age_ms: Option<u64>,
}

/// Priority-ordered, TTL-bounded, size-bounded outbound buffer
#[derive(Debug)]
pub struct MessageQueue {
    config: QueueConfig,
    entries: VecDeque<QueuedMessage>,
    total_enqueued: u64,
    total_dequeued: u64,
    total_expired: u64,
    total_evicted: u64,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            total_enqueued: 0,
            total_dequeued: 0,
            total_expired: 0,
            total_evicted: 0,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Buffer a message, evicting the oldest low/normal entry if the queue is full
    pub fn enqueue(&mut self, message: Message) -> MeshResult<()> {
        self.purge_expired();

        if self.entries.len() >= self.config.max_size && !self.evict_oldest_evictable() {
            warn!(
                message_id = %message.id,
                size = self.entries.len(),
                "message queue full with no evictable entry"
            );
            return Err(MeshError::overflow(self.entries.len(), self.config.max_size));
        }

        let entry = QueuedMessage::new(
            message,
            Duration::from_millis(self.config.ttl_ms),
            self.total_enqueued,
        );
        let position = self
            .entries
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(self.entries.len());

        debug!(
            message_id = %entry.message.id,
            priority = ?entry.priority,
            position,
            "message queued"
        );
        self.entries.insert(position, entry);
        self.total_enqueued += 1;
        Ok(())
    }

    /// Remove and return the highest-priority live message
    pub fn dequeue(&mut self) -> Option<Message> {
        self.purge_expired();
        let entry = self.entries.pop_front()?;
        self.total_dequeued += 1;
        Some(entry.message)
    }

    pub fn peek(&mut self) -> Option<&Message> {
        self.purge_expired();
        self.entries.front().map(|entry| &entry.message)
    }

    /// Remove every live message in dequeue order
    pub fn drain_all(&mut self) -> Vec<Message> {
        self.purge_expired();
        let drained: Vec<Message> = self.entries.drain(..).map(|entry| entry.message).collect();
        self.total_dequeued += drained.len() as u64;
        drained
    }

    /// Remove a specific message by id
    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.message.id == message_id)?;
        self.entries.remove(index).map(|entry| entry.message)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&mut self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&mut self) -> bool {
        self.len() >= self.config.max_size
    }

    pub fn stats(&mut self) -> QueueStats {
        self.purge_expired();
        let now = Instant::now();
        let oldest_message_age_ms = self
            .entries
            .iter()
            .map(|entry| entry.queued_at)
            .min()
            .map(|queued_at| now.duration_since(queued_at).as_millis() as u64);

        QueueStats {
            size: self.entries.len(),
            max_size: self.config.max_size,
            total_enqueued: self.total_enqueued,
            total_dequeued: self.total_dequeued,
            total_expired: self.total_expired,
            total_evicted: self.total_evicted,
            oldest_message_age_ms,
        }
    }

    /// Apply new limits; a smaller `max_size` trims the lowest-priority tail
    pub fn update_config(&mut self, config: QueueConfig) {
        let trimmed = self.entries.len().saturating_sub(config.max_size);
        if trimmed > 0 {
            self.entries.truncate(config.max_size);
            self.total_evicted += trimmed as u64;
            warn!(trimmed, "queue shrunk, dropped lowest-priority messages");
        }
        self.config = config;
    }

    /// Discard everything; there is no durable store behind this queue
    pub fn destroy(&mut self) {
        if !self.entries.is_empty() {
            info!(
                discarded = self.entries.len(),
                "message queue destroyed with pending messages"
            );
        }
        self.entries.clear();
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_expired(now));
        let expired = before - self.entries.len();
        if expired > 0 {
            self.total_expired += expired as u64;
            debug!(expired, "purged expired messages");
        }
    }

    /// Evict the oldest low or normal message. Returns false if none is eligible.
    fn evict_oldest_evictable(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.priority.is_evictable())
            .min_by_key(|(_, entry)| (entry.queued_at, entry.sequence))
            .map(|(index, _)| index);

        match victim.and_then(|index| self.entries.remove(index)) {
            Some(evicted) => {
                self.total_evicted += 1;
                warn!(
                    message_id = %evicted.message.id,
                    priority = ?evicted.priority,
                    "evicted message from full queue"
                );
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceType, MessageDestination, MessageSource, MessageType};
    use serde_json::json;

    fn message(label: &str, priority: MessagePriority) -> Message {
        let source = MessageSource {
            device_id: "phone".to_string(),
            user_id: "user".to_string(),
            device_type: DeviceType::Mobile,
            timestamp: 0,
        };
        let mut message = Message::new(
            source,
            MessageDestination::cloud(),
            MessageType::UserInput,
            json!({ "label": label }),
        )
        .with_priority(priority);
        message.id = label.to_string();
        message
    }

    fn queue_with_capacity(max_size: usize) -> MessageQueue {
        MessageQueue::new(QueueConfig {
            max_size,
            ..Default::default()
        })
    }

    fn dequeue_ids(queue: &mut MessageQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue()).map(|m| m.id).collect()
    }

    #[test]
    fn test_dequeue_is_priority_descending() {
        let mut queue = queue_with_capacity(10);
        queue.enqueue(message("low", MessagePriority::Low)).unwrap();
        queue.enqueue(message("high", MessagePriority::High)).unwrap();
        queue.enqueue(message("normal", MessagePriority::Normal)).unwrap();

        assert_eq!(dequeue_ids(&mut queue), vec!["high", "normal", "low"]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = queue_with_capacity(10);
        queue.enqueue(message("n1", MessagePriority::Normal)).unwrap();
        queue.enqueue(message("c1", MessagePriority::Critical)).unwrap();
        queue.enqueue(message("n2", MessagePriority::Normal)).unwrap();
        queue.enqueue(message("c2", MessagePriority::Critical)).unwrap();
        queue.enqueue(message("n3", MessagePriority::Normal)).unwrap();

        assert_eq!(dequeue_ids(&mut queue), vec!["c1", "c2", "n1", "n2", "n3"]);
    }

    #[test]
    fn test_full_queue_of_critical_overflows() {
        let mut queue = queue_with_capacity(2);
        queue.enqueue(message("c1", MessagePriority::Critical)).unwrap();
        queue.enqueue(message("c2", MessagePriority::Critical)).unwrap();

        let err = queue
            .enqueue(message("c3", MessagePriority::Critical))
            .unwrap_err();
        assert!(matches!(err, MeshError::Overflow { size: 2, max: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_evicts_oldest_low_or_normal() {
        let mut queue = queue_with_capacity(3);
        queue.enqueue(message("normal-old", MessagePriority::Normal)).unwrap();
        queue.enqueue(message("critical", MessagePriority::Critical)).unwrap();
        queue.enqueue(message("low-new", MessagePriority::Low)).unwrap();

        queue.enqueue(message("high", MessagePriority::High)).unwrap();

        assert_eq!(dequeue_ids(&mut queue), vec!["critical", "high", "low-new"]);
        assert_eq!(queue.stats().total_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_purged_on_dequeue() {
        let mut queue = MessageQueue::new(QueueConfig {
            ttl_ms: 1000,
            ..Default::default()
        });
        queue.enqueue(message("stale", MessagePriority::High)).unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        queue.enqueue(message("fresh", MessagePriority::Low)).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(queue.dequeue().map(|m| m.id), Some("fresh".to_string()));
        assert_eq!(queue.stats().total_expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_ttl_shortens_expiry() {
        let mut queue = queue_with_capacity(10);
        queue
            .enqueue(message("short", MessagePriority::Normal).with_ttl(100))
            .unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_and_peek() {
        let mut queue = queue_with_capacity(10);
        queue.enqueue(message("a", MessagePriority::Normal)).unwrap();
        queue.enqueue(message("b", MessagePriority::High)).unwrap();

        assert_eq!(queue.peek().map(|m| m.id.clone()), Some("b".to_string()));
        assert!(queue.remove("b").is_some());
        assert!(queue.remove("missing").is_none());
        assert_eq!(queue.peek().map(|m| m.id.clone()), Some("a".to_string()));
    }

    #[test]
    fn test_shrinking_config_trims_tail() {
        let mut queue = queue_with_capacity(10);
        queue.enqueue(message("low", MessagePriority::Low)).unwrap();
        queue.enqueue(message("critical", MessagePriority::Critical)).unwrap();
        queue.enqueue(message("normal", MessagePriority::Normal)).unwrap();

        queue.update_config(QueueConfig {
            max_size: 2,
            ..Default::default()
        });

        assert!(queue.is_full());
        assert_eq!(dequeue_ids(&mut queue), vec!["critical", "normal"]);
    }

    #[test]
    fn test_stats_track_totals() {
        let mut queue = queue_with_capacity(10);
        queue.enqueue(message("a", MessagePriority::Normal)).unwrap();
        queue.enqueue(message("b", MessagePriority::Normal)).unwrap();
        queue.dequeue();

        let stats = queue.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.total_enqueued, 2);
        assert_eq!(stats.total_dequeued, 1);
        assert!(stats.oldest_message_age_ms.is_some());
    }

    #[test]
    fn test_drain_all_and_destroy() {
        let mut queue = queue_with_capacity(10);
        queue.enqueue(message("a", MessagePriority::Low)).unwrap();
        queue.enqueue(message("b", MessagePriority::Critical)).unwrap();

        let drained: Vec<String> = queue.drain_all().into_iter().map(|m| m.id).collect();
        assert_eq!(drained, vec!["b", "a"]);

        queue.enqueue(message("c", MessagePriority::Low)).unwrap();
        queue.destroy();
        assert!(queue.is_empty());
    }
}
