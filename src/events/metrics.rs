//! Event service counters

use super::model::EventMetrics;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug)]
pub struct EventStats {
    published: u64,
    delivered: u64,
    failed: u64,
    average_latency_ms: f64,
    events_per_second: f64,
    rate_sampled_at: Instant,
    rate_sampled_count: u64,
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            published: 0,
            delivered: 0,
            failed: 0,
            average_latency_ms: 0.0,
            events_per_second: 0.0,
            rate_sampled_at: Instant::now(),
            rate_sampled_count: 0,
        }
    }

    pub fn record_published(&mut self) {
        self.published += 1;
    }

    pub fn record_delivered(&mut self, latency_ms: f64) {
        self.delivered += 1;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.delivered as f64;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    /// Failed deliveries and rejected publishes over everything attempted
    pub fn error_rate(&self) -> f64 {
        let attempts = self.delivered + self.failed;
        if attempts == 0 {
            0.0
        } else {
            self.failed as f64 / attempts as f64
        }
    }

    /// Recompute deliveries per second since the previous sample
    pub fn sample_rate(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.rate_sampled_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta = self.delivered - self.rate_sampled_count;
            self.events_per_second = delta as f64 / elapsed;
        }
        self.rate_sampled_at = now;
        self.rate_sampled_count = self.delivered;
    }

    pub fn snapshot(
        &self,
        active_subscriptions: usize,
        queue_depths: BTreeMap<String, usize>,
    ) -> EventMetrics {
        EventMetrics {
            events_published: self.published,
            events_delivered: self.delivered,
            events_failed: self.failed,
            active_subscriptions,
            average_latency_ms: self.average_latency_ms,
            error_rate: self.error_rate(),
            events_per_second: self.events_per_second,
            queue_depths,
        }
    }
}
