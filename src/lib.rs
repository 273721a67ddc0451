//! devicemesh - multi-device command and event synchronization
//!
//! Keeps a set of devices belonging to one user in sync over a broker link.
//!
//! # Overview
//!
//! - [`transport`] - Connection state machine, heartbeat, backoff reconnection and the
//!   [`ProtocolClient`] that drives a [`transport::Link`] (MQTT in production)
//! - [`pipeline`] - Offline priority queue, batcher and compression codec
//! - [`commands`] - Per-user command queues with pluggable routing and execution
//! - [`events`] - Priority-tiered event broadcasting to subscriptions
//! - [`dispatch`] - Routes inbound wire messages to the services
//! - [`observability`] - Logging, metrics and the health server
//!
//! # Quick Start
//!
//! ```rust
//! use devicemesh::protocol::{DeviceInfo, DeviceType, Message, MessageDestination, MessageType};
//! use serde_json::json;
//!
//! let device = DeviceInfo {
//!     device_id: "laptop".to_string(),
//!     user_id: "alice".to_string(),
//!     device_type: DeviceType::Desktop,
//!     platform: "linux".to_string(),
//!     version: "1.0.0".to_string(),
//!     capabilities: Default::default(),
//! };
//!
//! let message = Message::new(
//!     device.source(),
//!     MessageDestination::device("phone"),
//!     MessageType::Command,
//!     json!({"action": "sync"}),
//! )
//! .requiring_ack();
//!
//! let wire = serde_json::to_value(&message).unwrap();
//! assert_eq!(wire["protocolVersion"], "1.0.0");
//! assert_eq!(wire["optimization"]["requiresAck"], true);
//! ```

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod observability;
pub mod observer;
pub mod pipeline;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use commands::{CommandQueueService, CommandServiceConfig};
pub use config::{ConfigError, MeshConfig};
pub use dispatch::{DispatchEvent, InboundDispatcher};
pub use error::{ErrorCode, MeshError, MeshResult};
pub use events::{EventBroadcastService, EventServiceConfig};
pub use observer::{ObserverId, ObserverRegistry};
pub use transport::{ClientConfig, ClientEvent, ConnectionState, ProtocolClient};
