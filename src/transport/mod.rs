//! Transport layer for device links
//!
//! The physical wire is abstracted behind [`Link`] so the protocol client can run over MQTT in
//! production and over an in-memory link in tests.
//!
//! - [`connection`] - Pure connection state, retry and heartbeat configuration
//! - [`health_monitor`] - Pure reconnection decisions and heartbeat bookkeeping
//! - [`client`] - The protocol client that drives a link
//! - [`mqtt`] - MQTT implementation of [`Link`]

use crate::error::MeshResult;
use crate::protocol::{Acknowledgment, DeviceInfo, Message};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod mqtt;

pub use client::{ClientConfig, ClientEvent, InboundHandler, ProtocolClient};
pub use connection::{
    BackoffStrategy, ConnectionMetrics, ConnectionQuality, ConnectionSnapshot, ConnectionState,
    HeartbeatConfig, NetworkMonitor, NetworkType, RetryConfig, HEARTBEAT_TIMEOUT_CLOSURE,
    NORMAL_CLOSURE,
};
pub use health_monitor::{
    ConnectionEvent, HealthMonitor, HeartbeatAction, HeartbeatTracker, ReconnectionDecision,
};

/// Close code reported when the link goes away without a close handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A complete inbound frame
    Frame(Vec<u8>),
    /// Reply to a heartbeat ping
    Pong,
    /// The link closed; `code` follows websocket close-code conventions
    Closed { code: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link open failed: {0}")]
    OpenFailed(String),
    #[error("Link send failed: {0}")]
    SendFailed(String),
    #[error("Link is not open")]
    NotOpen,
    #[error("Invalid link configuration: {0}")]
    InvalidConfig(String),
}

/// A bidirectional frame link to the mesh
///
/// `open` performs the handshake and returns the event stream of the new session. A link is
/// re-openable: the client calls `open` again for every reconnection attempt.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError>;

    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError>;

    /// Send a heartbeat ping; the answer arrives as [`LinkEvent::Pong`]
    async fn ping(&self) -> Result<(), LinkError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), LinkError>;
}

/// Anything that can put a message on the mesh on behalf of a local device
///
/// Returns the final acknowledgment for messages that require one.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn local_device(&self) -> &DeviceInfo;

    async fn send(&self, message: Message) -> MeshResult<Option<Acknowledgment>>;
}
