//! Inbound dispatch from the wire into the command and event services
//!
//! Messages are injected on a mock link so they travel the same path as broker traffic:
//! frame parsing, acknowledgments, then the dispatcher.

use devicemesh::commands::{
    Command, CommandPriority, CommandQueueService, CommandServiceConfig, CommandStatus,
    CommandType,
};
use devicemesh::dispatch::{DispatchEvent, InboundDispatcher};
use devicemesh::events::{EventBroadcastService, EventServiceConfig};
use devicemesh::protocol::{AckStatus, Message, MessageDestination, MessageType};
use devicemesh::testing::{test_device, MockLink, RecordingSink, ScriptedExecutor, ScriptedRouter};
use devicemesh::transport::{ClientConfig, ProtocolClient};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

struct Node {
    client: ProtocolClient<MockLink>,
    commands: Arc<CommandQueueService>,
    events: Arc<EventBroadcastService>,
    sink: Arc<RecordingSink>,
    dispatcher: Arc<InboundDispatcher>,
}

async fn node() -> Node {
    let commands = Arc::new(CommandQueueService::new(
        CommandServiceConfig::default(),
        Arc::new(ScriptedRouter::new()),
        Arc::new(ScriptedExecutor::new()),
    ));
    let sink = Arc::new(RecordingSink::new());
    let events = Arc::new(EventBroadcastService::new(
        EventServiceConfig::default(),
        sink.clone(),
    ));
    events.start().unwrap();

    let dispatcher = Arc::new(InboundDispatcher::new(
        Arc::clone(&commands),
        Arc::clone(&events),
    ));
    let client = ProtocolClient::new(MockLink::new(), test_device("hub"), ClientConfig::default());
    client.set_handler(dispatcher.clone());
    client.connect().await.unwrap();

    Node {
        client,
        commands,
        events,
        sink,
        dispatcher,
    }
}

fn inbound(destination: MessageDestination, message_type: MessageType, payload: Value) -> Message {
    Message::new(
        test_device("phone").source(),
        destination,
        message_type,
        payload,
    )
    .requiring_ack()
}

fn sync_command() -> Command {
    Command::new(
        CommandType::FileSync,
        "test-user",
        "phone",
        vec!["laptop".to_string()],
        json!({"path": "/notes.md"}),
    )
    .with_priority(CommandPriority::High)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn final_ack_status(node: &Node, message_id: &str) -> Option<AckStatus> {
    node.client
        .link()
        .sent_acks()
        .into_iter()
        .filter(|ack| ack.message_id == message_id && ack.is_final())
        .map(|ack| ack.status)
        .last()
}

#[tokio::test]
async fn test_cloud_command_is_queued_and_acknowledged() {
    let node = node().await;
    let command = sync_command();
    let message = inbound(
        MessageDestination::cloud(),
        MessageType::Command,
        serde_json::to_value(&command).unwrap(),
    );

    assert!(node.client.link().inject_message(&message));
    wait_until(|| final_ack_status(&node, &message.id).is_some()).await;

    assert_eq!(final_ack_status(&node, &message.id), Some(AckStatus::Processed));
    let acks = node.client.link().sent_acks();
    assert_eq!(acks[0].status, AckStatus::Received);
    wait_until(|| {
        node.commands.get_command(&command.id).map(|c| c.status) == Some(CommandStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn test_cloud_command_honours_queue_id() {
    let node = node().await;
    let queue = node
        .commands
        .create_queue("test-user", "sync", None)
        .unwrap();
    node.commands.pause_queue(&queue.id).unwrap();

    let command = sync_command();
    let mut payload = serde_json::to_value(&command).unwrap();
    payload["queueId"] = json!(queue.id);
    let message = inbound(MessageDestination::cloud(), MessageType::Command, payload);

    node.client.link().inject_message(&message);
    wait_until(|| final_ack_status(&node, &message.id).is_some()).await;

    assert_eq!(node.commands.get_queue_stats(&queue.id).unwrap().queued, 1);
    assert_eq!(
        node.commands.get_command(&command.id).unwrap().status,
        CommandStatus::Queued
    );
}

#[tokio::test]
async fn test_device_command_is_reported_not_queued() {
    let node = node().await;
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&delivered);
    node.dispatcher
        .observers()
        .subscribe(move |event: &DispatchEvent| seen.lock().unwrap().push(event.clone()));

    let command = sync_command();
    let message = inbound(
        MessageDestination::device("hub"),
        MessageType::Command,
        serde_json::to_value(&command).unwrap(),
    );
    node.client.link().inject_message(&message);
    wait_until(|| final_ack_status(&node, &message.id).is_some()).await;

    assert_eq!(final_ack_status(&node, &message.id), Some(AckStatus::Processed));
    assert!(node.commands.get_command(&command.id).is_none());
    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    match &delivered[0] {
        DispatchEvent::CommandDelivered {
            message_id,
            command: received,
        } => {
            assert_eq!(message_id, &message.id);
            assert_eq!(received.id, command.id);
        }
    }
}

#[tokio::test]
async fn test_malformed_command_is_nacked() {
    let node = node().await;
    let message = inbound(
        MessageDestination::cloud(),
        MessageType::Command,
        json!({"type": "file_sync"}),
    );

    node.client.link().inject_message(&message);
    wait_until(|| final_ack_status(&node, &message.id).is_some()).await;

    let ack = node
        .client
        .link()
        .sent_acks()
        .into_iter()
        .find(|ack| ack.message_id == message.id && ack.status == AckStatus::Failed)
        .expect("failed ack");
    assert!(ack.error.unwrap().message.contains("command"));
}

#[tokio::test]
async fn test_subscription_and_event_messages() {
    let node = node().await;

    let subscribe = inbound(
        MessageDestination::cloud(),
        MessageType::EventSubscription,
        json!({
            "userId": "test-user",
            "deviceId": "phone",
            "eventTypes": ["file_changed"],
        }),
    );
    node.client.link().inject_message(&subscribe);
    wait_until(|| final_ack_status(&node, &subscribe.id).is_some()).await;
    let subscriptions = node.events.get_user_subscriptions("test-user");
    assert_eq!(subscriptions.len(), 1);

    let publish = inbound(
        MessageDestination::broadcast(),
        MessageType::Event,
        json!({
            "type": "file_changed",
            "source": {"userId": "test-user", "deviceId": "laptop"},
            "payload": {"path": "/notes.md"},
            "priority": "high",
        }),
    );
    node.client.link().inject_message(&publish);
    wait_until(|| node.sink.deliveries().len() == 1).await;
    assert_eq!(final_ack_status(&node, &publish.id), Some(AckStatus::Processed));

    let unsubscribe = inbound(
        MessageDestination::cloud(),
        MessageType::EventSubscription,
        json!({"action": "unsubscribe", "subscriptionId": subscriptions[0].id}),
    );
    node.client.link().inject_message(&unsubscribe);
    wait_until(|| final_ack_status(&node, &unsubscribe.id).is_some()).await;
    assert_eq!(final_ack_status(&node, &unsubscribe.id), Some(AckStatus::Processed));
    assert!(node.events.get_user_subscriptions("test-user").is_empty());
}

#[tokio::test]
async fn test_bad_subscription_actions_are_nacked() {
    let node = node().await;

    let unknown = inbound(
        MessageDestination::cloud(),
        MessageType::EventSubscription,
        json!({"action": "resubscribe"}),
    );
    let missing_id = inbound(
        MessageDestination::cloud(),
        MessageType::EventSubscription,
        json!({"action": "unsubscribe"}),
    );
    let unknown_id = inbound(
        MessageDestination::cloud(),
        MessageType::EventSubscription,
        json!({"action": "unsubscribe", "subscriptionId": "sub_missing"}),
    );

    for message in [&unknown, &missing_id, &unknown_id] {
        node.client.link().inject_message(message);
    }
    wait_until(|| final_ack_status(&node, &unknown_id.id).is_some()).await;

    for message in [&unknown, &missing_id, &unknown_id] {
        assert_eq!(final_ack_status(&node, &message.id), Some(AckStatus::Failed));
    }
}

#[tokio::test]
async fn test_unhandled_message_types_are_processed() {
    let node = node().await;
    let message = inbound(
        MessageDestination::device("hub"),
        MessageType::UserInput,
        json!({"text": "hello"}),
    );

    node.client.link().inject_message(&message);
    wait_until(|| final_ack_status(&node, &message.id).is_some()).await;

    assert_eq!(final_ack_status(&node, &message.id), Some(AckStatus::Processed));
}
