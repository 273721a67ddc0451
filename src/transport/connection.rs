//! Pure connection state and configuration
//!
//! State machine vocabulary, retry/heartbeat configuration, backoff calculation and the
//! serializable connection snapshot. Nothing here touches the network.

use crate::protocol::{prefixed_id, DeviceInfo};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound of the random extra delay added when jitter is enabled
pub const MAX_JITTER_MS: u64 = 1000;

/// Close code of an intentional, clean teardown. Any other code triggers reconnection.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the heartbeat gives up on the peer
pub const HEARTBEAT_TIMEOUT_CLOSURE: u16 = 4000;

/// Connection state of one physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, and the state after teardown or exhausted reconnection
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake complete, heartbeat running
    Connected,
    /// Waiting out the backoff before reconnection attempt `n`
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::default(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Deterministic delay before attempt `attempt` (1-indexed), without jitter
    pub fn base_backoff_delay(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                let factor = 2u64.saturating_pow(attempt - 1);
                self.base_delay_ms
                    .saturating_mul(factor)
                    .min(self.max_delay_ms)
            }
            BackoffStrategy::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(attempt))
                .min(self.max_delay_ms),
            BackoffStrategy::Fixed => self.base_delay_ms,
        }
    }

    /// Delay before attempt `attempt`, including jitter when enabled
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_backoff_delay(attempt);
        if self.jitter {
            delay + rand::thread_rng().gen_range(0..=MAX_JITTER_MS)
        } else {
            delay
        }
    }

    /// Worst-case time spent backing off across all attempts, jitter excluded
    pub fn calculate_max_total_time(&self) -> u64 {
        (1..=self.max_attempts)
            .map(|attempt| self.base_backoff_delay(attempt))
            .sum()
    }
}

/// Application-level ping/pong settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// How long a ping may go unanswered before it counts as missed
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_missed() -> u32 {
    3
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
            max_missed: default_max_missed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    #[default]
    Unknown,
}

/// Connection quality grade derived from latency and reconnect history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Last known network conditions of the link
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMonitor {
    pub connection_type: NetworkType,
    pub is_online: bool,
    pub quality: ConnectionQuality,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self {
            connection_type: NetworkType::Unknown,
            is_online: false,
            quality: ConnectionQuality::Critical,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub reconnect_count: u32,
    /// Accumulated connected time across sessions, in milliseconds
    pub total_uptime_ms: u64,
    /// Running average of ping round-trips, in milliseconds
    pub average_latency_ms: f64,
    pub latency_samples: u64,
}

impl ConnectionMetrics {
    pub fn record_latency(&mut self, latency_ms: f64) {
        self.latency_samples += 1;
        let n = self.latency_samples as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub state: ConnectionState,
    pub device: DeviceInfo,
    pub session_start_time: Option<i64>,
    pub network: NetworkMonitor,
    pub metrics: ConnectionMetrics,
    pub permanently_disconnected: bool,
}

/// Identifier of one connection session: `conn_{millis}_{random}`
pub fn new_connection_id() -> String {
    prefixed_id("conn")
}
