//! Wire envelopes exchanged between devices
//!
//! All envelopes serialize to camelCase JSON. A [`Message`] is the unit of delivery, a [`Batch`]
//! groups messages into one wire unit and an [`Acknowledgment`] reports what happened to a
//! message that asked for one.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Version stamped on every outgoing message
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Build an identifier of the form `{prefix}_{millis}_{random}`
pub fn prefixed_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("{prefix}_{}_{suffix}", now_millis())
}

/// Delivery priority of a message. Ordering follows urgency: `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// Low and normal messages may be evicted from a full queue
    pub fn is_evictable(&self) -> bool {
        matches!(self, MessagePriority::Low | MessagePriority::Normal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Brotli,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Brotli => "brotli",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Mobile,
    Desktop,
    Web,
    Tablet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageTarget {
    Extension,
    Device,
    Broadcast,
    Cloud,
}

/// Message type discriminator. Unknown types are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Heartbeat,
    DeviceRegistration,
    Command,
    FileOperation,
    Acknowledgment,
    UserInput,
    Event,
    EventSubscription,
    Other(String),
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "heartbeat" => MessageType::Heartbeat,
            "device_registration" => MessageType::DeviceRegistration,
            "command" => MessageType::Command,
            "file_operation" => MessageType::FileOperation,
            "acknowledgment" => MessageType::Acknowledgment,
            "user_input" => MessageType::UserInput,
            "event" => MessageType::Event,
            "event_subscription" => MessageType::EventSubscription,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::DeviceRegistration => "device_registration",
            MessageType::Command => "command",
            MessageType::FileOperation => "file_operation",
            MessageType::Acknowledgment => "acknowledgment",
            MessageType::UserInput => "user_input",
            MessageType::Event => "event",
            MessageType::EventSubscription => "event_subscription",
            MessageType::Other(other) => other,
        }
    }
}

/// Originating device of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSource {
    pub device_id: String,
    pub user_id: String,
    pub device_type: DeviceType,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDestination {
    pub target: MessageTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl MessageDestination {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            target: MessageTarget::Device,
            device_id: Some(device_id.into()),
        }
    }

    pub fn broadcast() -> Self {
        Self {
            target: MessageTarget::Broadcast,
            device_id: None,
        }
    }

    pub fn cloud() -> Self {
        Self {
            target: MessageTarget::Cloud,
            device_id: None,
        }
    }
}

/// Delivery hints attached to every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Optimization {
    pub priority: MessagePriority,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionType>,
    /// Time-to-live in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Wire message envelope
///
/// # Examples
/// ```
/// use devicemesh::protocol::{
///     DeviceType, Message, MessageDestination, MessagePriority, MessageSource, MessageType,
/// };
/// use serde_json::json;
///
/// let source = MessageSource {
///     device_id: "phone-1".to_string(),
///     user_id: "user-1".to_string(),
///     device_type: DeviceType::Mobile,
///     timestamp: 0,
/// };
/// let message = Message::new(
///     source,
///     MessageDestination::cloud(),
///     MessageType::UserInput,
///     json!({"text": "hi"}),
/// )
/// .with_priority(MessagePriority::High)
/// .requiring_ack();
///
/// let wire = serde_json::to_string(&message).unwrap();
/// assert!(wire.contains("\"protocolVersion\":\"1.0.0\""));
/// assert!(wire.contains("\"requiresAck\":true"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub protocol_version: String,
    pub source: MessageSource,
    pub destination: MessageDestination,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub optimization: Optimization,
}

impl Message {
    pub fn new(
        source: MessageSource,
        destination: MessageDestination,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            source,
            destination,
            message_type,
            payload,
            optimization: Optimization::default(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.optimization.priority = priority;
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.optimization.requires_ack = true;
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.optimization.ttl = Some(ttl_ms);
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.optimization.compression = Some(compression);
        self
    }

    pub fn priority(&self) -> MessagePriority {
        self.optimization.priority
    }

    pub fn requires_ack(&self) -> bool {
        self.optimization.requires_ack
    }

    /// Size of the JSON encoding in bytes
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub total_size: usize,
    pub message_count: usize,
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Transient aggregation of outbound messages sent as one wire unit
///
/// A compressed batch carries an empty `messages` array and the compressed JSON array of
/// messages, base64 encoded, in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionType>,
    pub messages: Vec<Message>,
    pub metadata: BatchMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Batch {
    /// Build a batch from messages, deriving priority (max) and ttl (min) from the members
    pub fn from_messages(id: String, messages: Vec<Message>) -> Self {
        let total_size = messages.iter().map(Message::serialized_size).sum();
        let priority = messages
            .iter()
            .map(Message::priority)
            .max()
            .unwrap_or_default();
        let ttl = messages.iter().filter_map(|m| m.optimization.ttl).min();

        Self {
            id,
            timestamp: now_millis(),
            compression: None,
            metadata: BatchMetadata {
                total_size,
                message_count: messages.len(),
                priority,
                ttl,
            },
            messages,
            data: None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.data.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Received,
    Processed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub message_id: String,
    pub status: AckStatus,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl Acknowledgment {
    pub fn new(message_id: impl Into<String>, status: AckStatus) -> Self {
        Self {
            message_id: message_id.into(),
            status,
            timestamp: now_millis(),
            error: None,
        }
    }

    pub fn received(message_id: impl Into<String>) -> Self {
        Self::new(message_id, AckStatus::Received)
    }

    pub fn processed(message_id: impl Into<String>) -> Self {
        Self::new(message_id, AckStatus::Processed)
    }

    pub fn failed(message_id: impl Into<String>, error: AckError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(message_id, AckStatus::Failed)
        }
    }

    /// Whether this ack ends the exchange for the message
    pub fn is_final(&self) -> bool {
        !matches!(self.status, AckStatus::Received)
    }
}

/// Any frame that can arrive on the wire
///
/// Variant order matters: a frame with `messages` is a batch, a frame with `messageId` and
/// `status` is an acknowledgment, anything else must be a single message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Batch(Batch),
    Ack(Acknowledgment),
    Message(Box<Message>),
}

impl InboundFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Best-effort recovery of the `id` field from a frame that failed to parse
pub fn recover_message_id(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    #[serde(default = "default_true")]
    pub supports_compression: bool,
    #[serde(default = "default_true")]
    pub supports_batching: bool,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            supports_compression: true,
            supports_batching: true,
            max_message_size: default_max_message_size(),
            features: Vec::new(),
        }
    }
}

/// Identity of the local device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub user_id: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

impl DeviceInfo {
    /// Source block for messages originating from this device
    pub fn source(&self) -> MessageSource {
        MessageSource {
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            device_type: self.device_type,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_source() -> MessageSource {
        MessageSource {
            device_id: "laptop-1".to_string(),
            user_id: "user-1".to_string(),
            device_type: DeviceType::Desktop,
            timestamp: 1_700_000_000_000,
        }
    }

    fn test_message(priority: MessagePriority) -> Message {
        Message::new(
            test_source(),
            MessageDestination::device("phone-1"),
            MessageType::Command,
            json!({"action": "sync"}),
        )
        .with_priority(priority)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
        assert!(MessagePriority::Low.is_evictable());
        assert!(MessagePriority::Normal.is_evictable());
        assert!(!MessagePriority::High.is_evictable());
    }

    #[test]
    fn test_message_wire_field_names() {
        let message = test_message(MessagePriority::High).requiring_ack().with_ttl(5000);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["protocolVersion"], "1.0.0");
        assert_eq!(value["type"], "command");
        assert_eq!(value["source"]["deviceId"], "laptop-1");
        assert_eq!(value["source"]["deviceType"], "desktop");
        assert_eq!(value["destination"]["target"], "device");
        assert_eq!(value["destination"]["deviceId"], "phone-1");
        assert_eq!(value["optimization"]["priority"], "high");
        assert_eq!(value["optimization"]["requiresAck"], true);
        assert_eq!(value["optimization"]["ttl"], 5000);
        assert!(value["optimization"].get("compression").is_none());
    }

    #[test]
    fn test_unknown_message_type_is_preserved() {
        let mut value = serde_json::to_value(test_message(MessagePriority::Normal)).unwrap();
        value["type"] = json!("clipboard_share");

        let message: Message = serde_json::from_value(value).unwrap();
        assert_eq!(
            message.message_type,
            MessageType::Other("clipboard_share".to_string())
        );
        assert_eq!(
            serde_json::to_value(&message).unwrap()["type"],
            "clipboard_share"
        );
    }

    #[test]
    fn test_batch_derives_priority_and_ttl() {
        let messages = vec![
            test_message(MessagePriority::Low).with_ttl(9000),
            test_message(MessagePriority::Critical),
            test_message(MessagePriority::Normal).with_ttl(3000),
        ];
        let expected_size: usize = messages.iter().map(Message::serialized_size).sum();

        let batch = Batch::from_messages("batch_1".to_string(), messages);

        assert_eq!(batch.metadata.priority, MessagePriority::Critical);
        assert_eq!(batch.metadata.ttl, Some(3000));
        assert_eq!(batch.metadata.message_count, 3);
        assert_eq!(batch.metadata.total_size, expected_size);
        assert!(!batch.is_compressed());
    }

    #[test]
    fn test_inbound_frame_detects_batch() {
        let batch = Batch::from_messages("b".to_string(), vec![test_message(MessagePriority::Low)]);
        let bytes = serde_json::to_vec(&batch).unwrap();

        assert!(matches!(InboundFrame::parse(&bytes).unwrap(), InboundFrame::Batch(_)));
    }

    #[test]
    fn test_inbound_frame_detects_ack() {
        let ack = Acknowledgment::processed("msg-1");
        let bytes = serde_json::to_vec(&ack).unwrap();

        match InboundFrame::parse(&bytes).unwrap() {
            InboundFrame::Ack(parsed) => {
                assert_eq!(parsed.message_id, "msg-1");
                assert_eq!(parsed.status, AckStatus::Processed);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_inbound_frame_detects_message() {
        let message = test_message(MessagePriority::Normal);
        let bytes = serde_json::to_vec(&message).unwrap();

        match InboundFrame::parse(&bytes).unwrap() {
            InboundFrame::Message(parsed) => assert_eq!(parsed.id, message.id),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_recovers_id() {
        let bytes = br#"{"id": "abc-123", "type": 42}"#;
        assert!(InboundFrame::parse(bytes).is_err());
        assert_eq!(recover_message_id(bytes), Some("abc-123".to_string()));
        assert_eq!(recover_message_id(b"garbage"), None);
    }

    #[test]
    fn test_failed_ack_carries_error() {
        let ack = Acknowledgment::failed(
            "msg-9",
            AckError {
                code: "PROCESSING_ERROR".to_string(),
                message: "handler failed".to_string(),
            },
        );
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["code"], "PROCESSING_ERROR");
        assert!(ack.is_final());
        assert!(!Acknowledgment::received("x").is_final());
    }

    #[test]
    fn test_prefixed_id_shape() {
        let id = prefixed_id("batch");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "batch");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }
}
