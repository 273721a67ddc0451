//! Pure health monitoring and reconnection logic
//!
//! Reconnection decisions, state transitions, heartbeat bookkeeping and connection quality
//! grading. The client in [`super::client`] drives these with real time and real I/O.

use super::connection::{ConnectionQuality, ConnectionState, HeartbeatConfig, RetryConfig};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to schedule reconnection attempt `current_attempts + 1`
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &RetryConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if current_attempts >= config.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
            ConnectionEvent::HandshakeSucceeded => ConnectionState::Connected,
            ConnectionEvent::HandshakeFailed(_)
            | ConnectionEvent::ConnectionLost(_)
            | ConnectionEvent::HeartbeatTimedOut
            | ConnectionEvent::ClosedCleanly
            | ConnectionEvent::ReconnectionExhausted => ConnectionState::Disconnected,
            ConnectionEvent::ReconnectionStarted(attempt) => {
                ConnectionState::Reconnecting(*attempt)
            }
        }
    }

    /// Whether a lost connection should be followed by reconnection
    pub fn requires_reconnection(event: &ConnectionEvent) -> bool {
        matches!(
            event,
            ConnectionEvent::ConnectionLost(_) | ConnectionEvent::HeartbeatTimedOut
        )
    }

    pub fn can_send(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("device link established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("device link lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!("starting reconnection attempt {}", attempt);
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("reconnection successful");
            }
            _ => {
                info!("device link state: {} -> {}", from, to);
            }
        }
    }

    /// Grade a connection from its average latency and reconnect history
    pub fn assess_connection_quality(
        connected: bool,
        average_latency_ms: f64,
        reconnect_count: u32,
    ) -> ConnectionQuality {
        if !connected {
            return ConnectionQuality::Critical;
        }

        match (reconnect_count, average_latency_ms) {
            (0, latency) if latency < 100.0 => ConnectionQuality::Excellent,
            (0..=2, latency) if latency < 300.0 => ConnectionQuality::Good,
            (0..=5, latency) if latency < 1000.0 => ConnectionQuality::Fair,
            (0..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }

    pub fn validate_retry_config(config: &RetryConfig) -> Result<(), String> {
        if config.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if config.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than 0".to_string());
        }
        if config.base_delay_ms > config.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".to_string());
        }
        Ok(())
    }

    pub fn validate_heartbeat_config(config: &HeartbeatConfig) -> Result<(), String> {
        if config.interval_ms == 0 {
            return Err("heartbeat interval_ms must be greater than 0".to_string());
        }
        if config.max_missed == 0 {
            return Err("heartbeat max_missed must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Events that move the connection state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectRequested,
    HandshakeSucceeded,
    HandshakeFailed(String),
    /// Abnormal close or transport error
    ConnectionLost(String),
    HeartbeatTimedOut,
    /// Explicit teardown with the normal close code
    ClosedCleanly,
    ReconnectionStarted(u32),
    ReconnectionExhausted,
}

/// What the heartbeat task should do on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    ForceClose { missed: u32 },
}

/// Missed-pong bookkeeping for one connection session
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    max_missed: u32,
    missed: u32,
    pending_ping: Option<Instant>,
    pong_timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            max_missed: config.max_missed,
            missed: 0,
            pending_ping: None,
            pong_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Called on every heartbeat interval tick
    ///
    /// An outstanding ping older than the pong timeout counts as missed; reaching `max_missed`
    /// asks for the connection to be closed.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent_at) = self.pending_ping {
            if now.duration_since(sent_at) >= self.pong_timeout {
                self.missed += 1;
                warn!(missed = self.missed, max = self.max_missed, "heartbeat pong missed");
            }
        }

        if self.missed >= self.max_missed {
            error!(missed = self.missed, "heartbeat threshold reached, closing link");
            return HeartbeatAction::ForceClose {
                missed: self.missed,
            };
        }

        self.pending_ping = Some(now);
        HeartbeatAction::SendPing
    }

    /// Record a pong and return the measured round-trip
    pub fn on_pong(&mut self, now: Instant) -> Option<Duration> {
        self.missed = 0;
        self.pending_ping
            .take()
            .map(|sent_at| now.duration_since(sent_at))
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}
