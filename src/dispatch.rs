//! Routes inbound wire messages to the command and event services

use crate::commands::{Command, CommandQueueService};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBroadcastService, NewEvent, SubscriptionRequest};
use crate::observer::ObserverRegistry;
use crate::protocol::{Message, MessageTarget, MessageType};
use crate::transport::InboundHandler;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Inbound traffic that is not consumed by a service
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A command addressed to this device for local execution
    CommandDelivered { message_id: String, command: Command },
}

/// [`InboundHandler`] that feeds the command queue and event services
///
/// - `command` to the cloud: enqueued on the command queue service
/// - `command` to a device: reported as [`DispatchEvent::CommandDelivered`]
/// - `event`: published on the event service
/// - `event_subscription`: subscribe, or unsubscribe when `action` is `"unsubscribe"`
pub struct InboundDispatcher {
    commands: Arc<CommandQueueService>,
    events: Arc<EventBroadcastService>,
    observers: ObserverRegistry<DispatchEvent>,
}

fn parse_payload<T: DeserializeOwned>(message: &Message, what: &str) -> MeshResult<T> {
    serde_json::from_value(message.payload.clone())
        .map_err(|e| MeshError::validation(format!("invalid {what} payload: {e}")))
}

impl InboundDispatcher {
    pub fn new(commands: Arc<CommandQueueService>, events: Arc<EventBroadcastService>) -> Self {
        Self {
            commands,
            events,
            observers: ObserverRegistry::new(),
        }
    }

    pub fn observers(&self) -> &ObserverRegistry<DispatchEvent> {
        &self.observers
    }

    fn dispatch_command(&self, message: &Message) -> MeshResult<()> {
        let command: Command = parse_payload(message, "command")?;

        if message.destination.target == MessageTarget::Cloud {
            let queue_id = message.payload.get("queueId").and_then(Value::as_str);
            let command_id = self.commands.enqueue_command(command, queue_id)?;
            debug!(command_id = %command_id, message_id = %message.id, "inbound command queued");
        } else {
            command.validate()?;
            info!(command_id = %command.id, from = %message.source.device_id, "command delivered");
            self.observers.notify(&DispatchEvent::CommandDelivered {
                message_id: message.id.clone(),
                command,
            });
        }
        Ok(())
    }

    fn dispatch_event(&self, message: &Message) -> MeshResult<()> {
        let event: NewEvent = parse_payload(message, "event")?;
        let result = self.events.publish_event(event)?;
        debug!(
            event_id = %result.event_id,
            matched = result.delivered_to.len(),
            "inbound event published"
        );
        Ok(())
    }

    fn dispatch_subscription(&self, message: &Message) -> MeshResult<()> {
        let action = message
            .payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("subscribe");

        match action {
            "subscribe" => {
                let request: SubscriptionRequest = parse_payload(message, "subscription")?;
                self.events.subscribe_to_events(request)?;
            }
            "unsubscribe" => {
                let subscription_id = message
                    .payload
                    .get("subscriptionId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MeshError::validation("subscriptionId is required"))?;
                self.events.unsubscribe(subscription_id)?;
            }
            other => {
                return Err(MeshError::validation(format!(
                    "unknown subscription action: {other}"
                )))
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for InboundDispatcher {
    async fn handle_message(&self, message: &Message) -> MeshResult<()> {
        match &message.message_type {
            MessageType::Command => self.dispatch_command(message),
            MessageType::Event => self.dispatch_event(message),
            MessageType::EventSubscription => self.dispatch_subscription(message),
            other => {
                debug!(
                    message_id = %message.id,
                    message_type = ?other,
                    "no dispatcher for message type"
                );
                Ok(())
            }
        }
    }
}
