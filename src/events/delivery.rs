//! Event delivery to subscribers

use super::model::{EventSubscription, RealTimeEvent};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{AckStatus, Message, MessageDestination, MessageType};
use crate::transport::MessageSender;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Where drained events go, once per matching subscription
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(
        &self,
        subscription: &EventSubscription,
        event: &RealTimeEvent,
    ) -> MeshResult<()>;
}

/// Relays events to the subscribing device as `event` wire messages
pub struct RelayEventSink {
    sender: Arc<dyn MessageSender>,
}

impl RelayEventSink {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventSink for RelayEventSink {
    async fn deliver(
        &self,
        subscription: &EventSubscription,
        event: &RealTimeEvent,
    ) -> MeshResult<()> {
        let payload = json!({
            "subscriptionId": subscription.id,
            "event": event,
        });
        let mut message = Message::new(
            self.sender.local_device().source(),
            MessageDestination::device(subscription.device_id.as_str()),
            MessageType::Event,
            payload,
        )
        .with_priority(event.priority.message_priority());
        if event.requires_ack {
            message = message.requiring_ack();
        }

        match self.sender.send(message).await? {
            Some(ack) if ack.status != AckStatus::Processed => {
                let reason = ack
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("{:?}", ack.status));
                Err(MeshError::protocol(format!(
                    "device {} rejected event {}: {reason}",
                    subscription.device_id, event.id
                )))
            }
            _ => Ok(()),
        }
    }
}
