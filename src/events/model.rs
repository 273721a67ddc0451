//! Event and subscription types

use crate::protocol::{now_millis, prefixed_id, MessagePriority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Event priority tiers; numeric values run from 1 (background) to 5 (critical)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl EventPriority {
    /// Every tier, highest first
    pub const TIERS: [EventPriority; 5] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
        EventPriority::Background,
    ];

    pub fn value(&self) -> u8 {
        match self {
            EventPriority::Background => 1,
            EventPriority::Low => 2,
            EventPriority::Normal => 3,
            EventPriority::High => 4,
            EventPriority::Critical => 5,
        }
    }

    /// Position in [`EventPriority::TIERS`]
    pub fn tier_index(&self) -> usize {
        5 - self.value() as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Background => "background",
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        }
    }

    pub fn message_priority(&self) -> MessagePriority {
        match self {
            EventPriority::Critical => MessagePriority::Critical,
            EventPriority::High => MessagePriority::High,
            EventPriority::Normal => MessagePriority::Normal,
            EventPriority::Low | EventPriority::Background => MessagePriority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventSource {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
            session_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// An event as submitted for publishing; id, timestamp and priority are filled in if absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub source: EventSource,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<EventPriority>,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, source: EventSource, payload: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            timestamp: None,
            source,
            payload,
            priority: None,
            requires_ack: false,
            permissions: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub(crate) fn into_event(self) -> RealTimeEvent {
        RealTimeEvent {
            id: self.id.unwrap_or_else(|| prefixed_id("evt")),
            event_type: self.event_type,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            source: self.source,
            payload: self.payload,
            priority: self.priority.unwrap_or_default(),
            requires_ack: self.requires_ack,
            permissions: self.permissions,
        }
    }
}

/// A published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: i64,
    pub source: EventSource,
    pub payload: Value,
    pub priority: EventPriority,
    pub requires_ack: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum EventFilter {
    /// `payload.sessionId`, falling back to `source.sessionId`
    Session(String),
    User(String),
    Device(String),
}

impl EventFilter {
    pub fn matches(&self, event: &RealTimeEvent) -> bool {
        match self {
            EventFilter::Session(value) => {
                let session = event
                    .payload
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .or(event.source.session_id.as_deref());
                session == Some(value.as_str())
            }
            EventFilter::User(value) => event.source.user_id == *value,
            EventFilter::Device(value) => event.source.device_id.as_deref() == Some(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Realtime,
    Batched,
    Polling,
}

/// What a caller asks for when subscribing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub user_id: String,
    pub device_id: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub filters: Vec<EventFilter>,
    /// Minimum event priority; defaults to normal
    #[serde(default)]
    pub priority: Option<EventPriority>,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl SubscriptionRequest {
    pub fn new<I, S>(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        event_types: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            filters: Vec::new(),
            priority: None,
            delivery_mode: None,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn expiring_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubscription {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub event_types: Vec<String>,
    pub filters: Vec<EventFilter>,
    pub priority: EventPriority,
    pub delivery_mode: DeliveryMode,
    pub is_active: bool,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub events_received: u64,
    /// Running mean of publish-to-delivery latency
    pub average_latency_ms: f64,
}

impl EventSubscription {
    pub(crate) fn from_request(request: SubscriptionRequest) -> Self {
        Self {
            id: prefixed_id("sub"),
            user_id: request.user_id,
            device_id: request.device_id,
            event_types: request.event_types,
            filters: request.filters,
            priority: request.priority.unwrap_or_default(),
            delivery_mode: request.delivery_mode.unwrap_or_default(),
            is_active: true,
            created_at: now_millis(),
            expires_at: request.expires_at,
            events_received: 0,
            average_latency_ms: 0.0,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn matches(&self, event: &RealTimeEvent, now: i64) -> bool {
        self.is_active
            && !self.is_expired(now)
            && self.event_types.iter().any(|t| *t == event.event_type)
            && event.priority >= self.priority
            && self.filters.iter().all(|f| f.matches(event))
    }

    pub fn record_delivery(&mut self, latency_ms: f64) {
        self.events_received += 1;
        let n = self.events_received as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Published,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub event_id: String,
    pub status: PublishStatus,
    /// Users with a matching subscription at publish time
    pub delivered_to: Vec<String>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetrics {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub active_subscriptions: usize,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub events_per_second: f64,
    /// Pending events per tier name
    pub queue_depths: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    pub fn from_metrics(metrics: &EventMetrics) -> Self {
        if metrics.error_rate > 0.1 {
            HealthLevel::Unhealthy
        } else if metrics.error_rate > 0.05 || metrics.average_latency_ms > 1000.0 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthLevel,
    pub running: bool,
    pub uptime_secs: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub throughput: f64,
    pub active_subscriptions: usize,
    pub queue_depths: BTreeMap<String, usize>,
    pub last_health_check: i64,
}

/// A completed delivery, reported to delivery observers
#[derive(Debug, Clone, PartialEq)]
pub struct EventDelivery {
    pub subscription: EventSubscription,
    pub event: RealTimeEvent,
}
