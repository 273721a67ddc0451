//! Health check HTTP server
//!
//! Exposes `/health`, `/ready`, `/live` and `/metrics` for operators and orchestrators. The
//! server reads link status from an atomic flag the runtime keeps current, and asks the attached
//! command and event services for their own view.

use crate::commands::CommandQueueService;
use crate::events::{EventBroadcastService, HealthLevel};
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    link_connected: AtomicBool,
    commands: Option<Arc<CommandQueueService>>,
    events: Option<Arc<EventBroadcastService>>,
}

impl HealthServer {
    pub fn new(device_id: impl Into<String>, port: u16) -> Self {
        Self {
            device_id: device_id.into(),
            port,
            link_connected: AtomicBool::new(false),
            commands: None,
            events: None,
        }
    }

    pub fn with_commands(mut self, commands: Arc<CommandQueueService>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBroadcastService>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_link_connected(&self, connected: bool) {
        self.link_connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_link_connected(&self) -> bool {
        self.link_connected.load(Ordering::Relaxed)
    }

    /// All endpoints as one warp filter
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
        let health_server = Arc::clone(self);
        let ready_server = Arc::clone(self);

        // GET /health - overall status with per-component checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(
                        warp::reply::with_status(warp::reply::json(&status), code).into_response(),
                    )
                }
            });

        // GET /ready - ready once the link is up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&ready_server);
                async move {
                    let ready = server.is_link_connected();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(
                        warp::reply::with_status(warp::reply::json(&response), code)
                            .into_response(),
                    )
                }
            });

        // GET /live
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async {
                let response = LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(warp::reply::json(&response).into_response())
            });

        // GET /metrics - process-wide counters
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async {
                Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()).into_response())
            });

        health_route
            .or(ready_route)
            .unify()
            .or(live_route)
            .unify()
            .or(metrics_route)
            .unify()
    }

    /// Serve until the task is aborted
    pub async fn start(self: Arc<Self>) {
        let routes = self.routes();
        tracing::info!(port = self.port, "starting health server");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    pub fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = HashMap::new();

        checks.insert("link".to_string(), self.check_link(now));
        if let Some(commands) = &self.commands {
            checks.insert("commands".to_string(), check_commands(commands, now));
        }
        if let Some(events) = &self.events {
            checks.insert("events".to_string(), check_events(events, now));
        }

        let healthy = checks.values().all(|check| check.status == "healthy");
        metrics().update_health_status(healthy);

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            device_id: self.device_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_link(&self, now: u64) -> HealthCheck {
        if self.is_link_connected() {
            HealthCheck::new("healthy", "link connected", now)
        } else {
            HealthCheck::new("unhealthy", "link disconnected", now)
        }
    }
}

fn check_commands(commands: &CommandQueueService, now: u64) -> HealthCheck {
    let snapshot = commands.get_metrics();
    HealthCheck::new(
        "healthy",
        format!(
            "{} commands across {} queues ({} active)",
            snapshot.total_commands, snapshot.total_queues, snapshot.active_queues
        ),
        now,
    )
}

fn check_events(events: &EventBroadcastService, now: u64) -> HealthCheck {
    let health = events.get_system_health();
    let status = match health.status {
        HealthLevel::Healthy => "healthy",
        HealthLevel::Degraded => "degraded",
        HealthLevel::Unhealthy => "unhealthy",
    };
    HealthCheck::new(
        status,
        format!(
            "error rate {:.3}, {} active subscriptions",
            health.error_rate, health.active_subscriptions
        ),
        now,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn new(status: &str, message: impl Into<String>, last_check: u64) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.into()),
            last_check,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub device_id: String,
    pub uptime_seconds: u64,
    pub checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
