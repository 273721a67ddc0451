//! Real-time event broadcasting
//!
//! - [`model`] - Events, subscriptions and metrics types
//! - [`router`] - Five-tier pending queue and drain policy
//! - [`subscriptions`] - Subscription index
//! - [`metrics`] - Service counters
//! - [`delivery`] - Delivery sinks
//! - [`service`] - The [`EventBroadcastService`]

pub mod delivery;
pub mod metrics;
pub mod model;
pub mod router;
pub mod service;
pub mod subscriptions;

pub use delivery::{EventSink, RelayEventSink};
pub use model::{
    DeliveryMode, EventDelivery, EventFilter, EventMetrics, EventPriority, EventSource,
    EventSubscription, HealthLevel, NewEvent, PublishResult, PublishStatus, RealTimeEvent,
    SubscriptionRequest, SystemHealth,
};
pub use router::{DrainPolicy, PriorityRouter, TierWeights};
pub use service::{EventBroadcastService, EventServiceConfig};
pub use subscriptions::SubscriptionIndex;
