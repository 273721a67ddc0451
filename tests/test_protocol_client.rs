//! Protocol client behaviour over an in-memory link
//!
//! Covers offline buffering, acknowledgment tracking, backoff reconnection, heartbeat timeouts
//! and teardown. Time is paused so backoff and heartbeat schedules run instantly.

use devicemesh::error::MeshError;
use devicemesh::protocol::{
    AckStatus, Acknowledgment, Message, MessageDestination, MessagePriority, MessageType,
};
use devicemesh::testing::{test_device, MockLink};
use devicemesh::transport::{
    ClientConfig, ClientEvent, ConnectionQuality, ConnectionState, HeartbeatConfig,
    ProtocolClient, RetryConfig, ABNORMAL_CLOSURE, HEARTBEAT_TIMEOUT_CLOSURE, NORMAL_CLOSURE,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn client_config(max_attempts: u32) -> ClientConfig {
    ClientConfig {
        retry: RetryConfig {
            max_attempts,
            base_delay_ms: 1000,
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn new_client(link: MockLink, max_attempts: u32) -> ProtocolClient<MockLink> {
    ProtocolClient::new(link, test_device("laptop"), client_config(max_attempts))
}

fn message(priority: MessagePriority) -> Message {
    Message::new(
        test_device("laptop").source(),
        MessageDestination::device("phone"),
        MessageType::Command,
        json!({"action": "sync"}),
    )
    .with_priority(priority)
}

fn record_events(client: &ProtocolClient<MockLink>) -> Arc<Mutex<Vec<ClientEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    client
        .observers()
        .subscribe(move |event: &ClientEvent| seen.lock().unwrap().push(event.clone()));
    events
}

#[tokio::test(start_paused = true)]
async fn test_offline_messages_flush_on_connect_in_priority_order() {
    let client = new_client(MockLink::new(), 3);
    let low = message(MessagePriority::Low);
    let critical = message(MessagePriority::Critical);

    assert_eq!(client.send_message(low.clone()).await.unwrap(), None);
    assert_eq!(client.send_message(critical.clone()).await.unwrap(), None);
    assert_eq!(client.queue_stats().await.size, 2);
    assert!(client.link().sent_frames().is_empty());

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.queue_stats().await.size, 0);
    let sent: Vec<String> = client
        .link()
        .sent_messages()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(sent, vec![critical.id, low.id]);
}

#[tokio::test(start_paused = true)]
async fn test_normal_messages_wait_for_the_batch_window() {
    let client = new_client(MockLink::new(), 3);
    client.connect().await.unwrap();

    client
        .send_message(message(MessagePriority::Normal))
        .await
        .unwrap();
    client
        .send_message(message(MessagePriority::Normal))
        .await
        .unwrap();
    assert!(client.link().sent_frames().is_empty());
    assert_eq!(client.batcher_stats().await.pending, 2);

    sleep(Duration::from_millis(150)).await;

    // Both messages travel in a single batch frame
    assert_eq!(client.link().sent_frames().len(), 1);
    assert_eq!(client.link().sent_messages().len(), 2);
    assert_eq!(client.batcher_stats().await.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_keeps_the_batch_pending() {
    let client = new_client(MockLink::new(), 3);
    let events = record_events(&client);
    client.connect().await.unwrap();

    client.link().set_fail_sends(true);
    let urgent = message(MessagePriority::Critical);
    assert_eq!(client.send_message(urgent.clone()).await.unwrap(), None);

    assert!(client.link().sent_frames().is_empty());
    assert_eq!(client.batcher_stats().await.pending, 1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ClientEvent::Error(_))));

    client.link().set_fail_sends(false);
    assert_eq!(client.flush().await.unwrap(), 1);
    assert_eq!(client.batcher_stats().await.pending, 0);
    let sent: Vec<String> = client
        .link()
        .sent_messages()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(sent, vec![urgent.id]);
}

#[tokio::test(start_paused = true)]
async fn test_state_watchers_and_quality_follow_the_link() {
    let client = new_client(MockLink::new(), 3);
    let mut state = client.subscribe_state();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert_eq!(client.connection_quality(), ConnectionQuality::Critical);

    client.connect().await.unwrap();

    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
    assert_eq!(client.connection_quality(), ConnectionQuality::Excellent);
}

#[tokio::test(start_paused = true)]
async fn test_final_ack_resolves_the_sender() {
    let client = Arc::new(new_client(MockLink::new(), 3));
    client.connect().await.unwrap();

    let outbound = message(MessagePriority::Normal).requiring_ack();
    let message_id = outbound.id.clone();
    let sender = Arc::clone(&client);
    let pending = tokio::spawn(async move { sender.send_message(outbound).await });

    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.pending_ack_count(), 1);
    assert!(client
        .link()
        .sent_messages()
        .iter()
        .any(|m| m.id == message_id));

    // A receipt is not final
    assert!(client.link().inject_ack(&Acknowledgment::received(&message_id)));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pending_ack_count(), 1);

    assert!(client.link().inject_ack(&Acknowledgment::processed(&message_id)));
    let ack = pending.await.unwrap().unwrap().expect("ack expected");
    assert_eq!(ack.status, AckStatus::Processed);
    assert_eq!(client.pending_ack_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_times_out() {
    let client = new_client(MockLink::new(), 3);
    client.connect().await.unwrap();

    let result = client
        .send_message(message(MessagePriority::High).requiring_ack())
        .await;

    assert!(matches!(result, Err(MeshError::Timeout { .. })));
    assert_eq!(client.pending_ack_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_reconnects_with_backoff() {
    let client = new_client(MockLink::new(), 3);
    let events = record_events(&client);
    client.connect().await.unwrap();

    assert!(client.link().drop_connection(ABNORMAL_CLOSURE, "peer vanished"));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Reconnecting(1));

    // Sent while reconnecting: buffered, then drained on reconnect
    let buffered = message(MessagePriority::High);
    client.send_message(buffered.clone()).await.unwrap();
    assert_eq!(client.queue_stats().await.size, 1);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.link().open_count(), 2);
    assert_eq!(client.metrics().reconnect_count, 1);
    assert!(client
        .link()
        .sent_messages()
        .iter()
        .any(|m| m.id == buffered.id));

    let events = events.lock().unwrap();
    assert!(events.contains(&ClientEvent::Reconnecting {
        attempt: 1,
        delay_ms: 1000
    }));
    assert!(events.contains(&ClientEvent::Reconnected { attempt: 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_gives_up_after_max_attempts() {
    let client = new_client(MockLink::new(), 2);
    client.connect().await.unwrap();

    client.link().fail_next_opens(2);
    client.link().drop_connection(ABNORMAL_CLOSURE, "peer vanished");

    // 1s then 2s of backoff, both attempts fail
    sleep(Duration::from_secs(10)).await;
    assert!(client.is_permanently_disconnected());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.link().open_count(), 3);

    // An explicit connect starts over
    client.connect().await.unwrap();
    assert!(!client.is_permanently_disconnected());
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_connect_stays_down_without_retry() {
    let client = new_client(MockLink::new(), 3);
    client.link().fail_next_opens(1);

    assert!(client.connect().await.is_err());
    sleep(Duration::from_secs(10)).await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.link().open_count(), 1);
    assert!(!client.is_permanently_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_connect_retries_with_backoff() {
    let client = new_client(MockLink::new(), 3);
    let events = record_events(&client);
    client.link().fail_next_opens(1);

    assert!(client.connect_with_retry().await.is_err());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Reconnecting(1));

    sleep(Duration::from_millis(1000)).await;
    assert!(client.is_connected());
    assert_eq!(client.link().open_count(), 2);
    assert!(events
        .lock()
        .unwrap()
        .contains(&ClientEvent::Reconnected { attempt: 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_connect_gives_up_after_max_attempts() {
    let client = new_client(MockLink::new(), 2);
    client.link().fail_next_opens(3);

    assert!(client.connect_with_retry().await.is_err());
    sleep(Duration::from_secs(10)).await;

    assert!(client.is_permanently_disconnected());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.link().open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_rejects_pending_waiters() {
    let client = Arc::new(new_client(MockLink::new(), 3));
    client.connect().await.unwrap();

    let sender = Arc::clone(&client);
    let pending = tokio::spawn(async move {
        sender
            .send_message(message(MessagePriority::Critical).requiring_ack())
            .await
    });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pending_ack_count(), 1);

    client.link().drop_connection(ABNORMAL_CLOSURE, "peer vanished");

    let result = pending.await.unwrap();
    assert!(matches!(
        result,
        Err(MeshError::Network {
            retryable: true,
            ..
        })
    ));
    assert_eq!(client.pending_ack_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_heartbeats_close_the_link() {
    let config = ClientConfig {
        heartbeat: HeartbeatConfig {
            interval_ms: 1000,
            timeout_ms: 500,
            max_missed: 2,
        },
        ..client_config(3)
    };
    let client = ProtocolClient::new(MockLink::new(), test_device("laptop"), config);
    client.connect().await.unwrap();

    sleep(Duration::from_millis(3500)).await;

    assert_eq!(client.link().ping_count(), 2);
    assert_eq!(client.link().close_codes(), vec![HEARTBEAT_TIMEOUT_CLOSURE]);
    assert_eq!(client.state(), ConnectionState::Reconnecting(1));
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeats_keep_the_link_open() {
    let config = ClientConfig {
        heartbeat: HeartbeatConfig {
            interval_ms: 1000,
            timeout_ms: 500,
            max_missed: 2,
        },
        ..client_config(3)
    };
    let client = ProtocolClient::new(MockLink::with_auto_pong(), test_device("laptop"), config);
    client.connect().await.unwrap();

    sleep(Duration::from_millis(10_500)).await;

    assert!(client.link().ping_count() >= 10);
    assert!(client.link().close_codes().is_empty());
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_reconnect() {
    let client = new_client(MockLink::new(), 3);
    client.connect().await.unwrap();

    assert!(client.link().is_open());
    client.disconnect().await.unwrap();
    sleep(Duration::from_secs(30)).await;

    assert!(!client.link().is_open());

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.link().open_count(), 1);
    assert_eq!(client.link().close_codes(), vec![NORMAL_CLOSURE]);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_rejects_waiters_and_further_use() {
    let client = Arc::new(new_client(MockLink::new(), 3));
    client.connect().await.unwrap();

    let sender = Arc::clone(&client);
    let pending = tokio::spawn(async move {
        sender
            .send_message(message(MessagePriority::Critical).requiring_ack())
            .await
    });
    sleep(Duration::from_millis(10)).await;

    client.destroy().await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(MeshError::InvalidState { .. })
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.link().close_codes(), vec![NORMAL_CLOSURE]);
    assert!(matches!(
        client.send_message(message(MessagePriority::Low)).await,
        Err(MeshError::InvalidState { .. })
    ));
    assert!(matches!(
        client.connect().await,
        Err(MeshError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_frame_is_nacked() {
    let client = new_client(MockLink::new(), 3);
    let events = record_events(&client);
    client.connect().await.unwrap();

    assert!(client
        .link()
        .inject_frame(br#"{"id":"m-broken","type":"command"}"#.to_vec()));
    sleep(Duration::from_millis(10)).await;

    let acks = client.link().sent_acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].message_id, "m-broken");
    assert_eq!(acks[0].status, AckStatus::Failed);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ClientEvent::Error(_))));
}
