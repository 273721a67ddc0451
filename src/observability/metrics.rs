//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! link, pipeline, command and event activity across the whole process.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Bounded history of command processing durations
const MAX_PROCESSING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Link metrics
    link_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_missed: AtomicU64,
    connection_start_time: AtomicU64,

    // Pipeline metrics
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_buffered: AtomicU64,
    batches_sent: AtomicU64,
    batches_received: AtomicU64,
    send_failures: AtomicU64,
    protocol_errors: AtomicU64,
    compressed_batches: AtomicU64,
    compression_bytes_saved: AtomicU64,

    // Command metrics
    commands_queued: AtomicU64,
    commands_completed: AtomicU64,
    commands_failed: AtomicU64,
    commands_cancelled: AtomicU64,
    command_processing_times: Mutex<Vec<u64>>,

    // Event metrics
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    events_failed: AtomicU64,

    // Lifecycle metrics
    uptime_start: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            link_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_missed: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_buffered: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_received: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            compressed_batches: AtomicU64::new(0),
            compression_bytes_saved: AtomicU64::new(0),
            commands_queued: AtomicU64::new(0),
            commands_completed: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_cancelled: AtomicU64::new(0),
            command_processing_times: Mutex::new(Vec::new()),
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            uptime_start: AtomicU64::new(now),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Link metrics
    pub fn link_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn link_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn link_connection_lost(&self) {
        self.link_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn link_reconnect_attempt(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_missed(&self) {
        self.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
    }

    // Pipeline metrics
    pub fn messages_sent(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_buffered(&self) {
        self.messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_received(&self) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_compressed(&self, original_len: usize, compressed_len: usize) {
        self.compressed_batches.fetch_add(1, Ordering::Relaxed);
        let saved = original_len.saturating_sub(compressed_len) as u64;
        self.compression_bytes_saved
            .fetch_add(saved, Ordering::Relaxed);
    }

    // Command metrics
    pub fn command_queued(&self) {
        self.commands_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_completed(&self, duration: Duration) {
        self.commands_completed.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(duration);
    }

    pub fn command_failed(&self, duration: Duration) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(duration);
    }

    pub fn command_cancelled(&self) {
        self.commands_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.command_processing_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > MAX_PROCESSING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Event metrics
    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_delivered(&self, count: u64) {
        self.events_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn event_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Health status metrics
    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn is_link_connected(&self) -> bool {
        self.link_connected.load(Ordering::Relaxed)
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnects,
            &self.heartbeats_sent,
            &self.heartbeats_missed,
            &self.connection_start_time,
            &self.messages_sent,
            &self.messages_received,
            &self.messages_buffered,
            &self.batches_sent,
            &self.batches_received,
            &self.send_failures,
            &self.protocol_errors,
            &self.compressed_batches,
            &self.compression_bytes_saved,
            &self.commands_queued,
            &self.commands_completed,
            &self.commands_failed,
            &self.commands_cancelled,
            &self.events_published,
            &self.events_delivered,
            &self.events_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.link_connected.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);
        if let Ok(mut times) = self.command_processing_times.lock() {
            times.clear();
        }
    }

    /// Calculate processing time statistics (pure function)
    fn calculate_processing_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.command_processing_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();
        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
        )
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.link_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95) = self.calculate_processing_time_statistics();
        let completed = self.commands_completed.load(Ordering::Relaxed);
        let failed = self.commands_failed.load(Ordering::Relaxed);
        let published = self.events_published.load(Ordering::Relaxed);
        let events_failed = self.events_failed.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            link: LinkMetrics {
                connected: self.link_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
                heartbeats_missed: self.heartbeats_missed.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            pipeline: PipelineMetrics {
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_buffered: self.messages_buffered.load(Ordering::Relaxed),
                batches_sent: self.batches_sent.load(Ordering::Relaxed),
                batches_received: self.batches_received.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
                protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
                compressed_batches: self.compressed_batches.load(Ordering::Relaxed),
                compression_bytes_saved: self.compression_bytes_saved.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                queued: self.commands_queued.load(Ordering::Relaxed),
                completed,
                failed,
                cancelled: self.commands_cancelled.load(Ordering::Relaxed),
                success_rate: ratio(completed, completed + failed),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
            },
            events: EventCounters {
                published,
                delivered: self.events_delivered.load(Ordering::Relaxed),
                failed: events_failed,
                error_rate: ratio(events_failed, published),
            },
            lifecycle: LifecycleMetrics {
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub link: LinkMetrics,
    pub pipeline: PipelineMetrics,
    pub commands: CommandMetrics,
    pub events: EventCounters,
    pub lifecycle: LifecycleMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_missed: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_buffered: u64,
    pub batches_sent: u64,
    pub batches_received: u64,
    pub send_failures: u64,
    pub protocol_errors: u64,
    pub compressed_batches: u64,
    pub compression_bytes_saved: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub success_rate: f64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventCounters {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
