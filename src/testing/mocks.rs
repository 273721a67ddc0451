//! Mock implementations for testing
//!
//! Provides a scriptable in-memory [`Link`], scripted command stages, a recording
//! [`MessageSender`] and a recording [`EventSink`] so the client and services can be exercised
//! without a broker.

use crate::commands::{
    Command, CommandExecutor, CommandOutcome, CommandRouter, RoutePlan, RoutingStrategy,
    StageError,
};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventSink, EventSubscription, RealTimeEvent};
use crate::pipeline::{expand_batch, CompressionCodec, CompressionConfig};
use crate::protocol::{AckStatus, Acknowledgment, DeviceInfo, DeviceType, InboundFrame, Message};
use crate::transport::{Link, LinkError, LinkEvent, MessageSender};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A device description for tests
pub fn test_device(device_id: &str) -> DeviceInfo {
    DeviceInfo {
        device_id: device_id.to_string(),
        user_id: "test-user".to_string(),
        device_type: DeviceType::Desktop,
        platform: "test".to_string(),
        version: "0.0.0".to_string(),
        capabilities: Default::default(),
    }
}

#[derive(Default)]
struct MockLinkState {
    events: Option<mpsc::Sender<LinkEvent>>,
    sent: Vec<Vec<u8>>,
    opens: usize,
    pings: usize,
    closes: Vec<(u16, String)>,
    failing_opens: usize,
    fail_sends: bool,
    auto_pong: bool,
}

/// In-memory [`Link`] whose behaviour tests script
#[derive(Default)]
pub struct MockLink {
    state: Mutex<MockLinkState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every ping with a pong
    pub fn with_auto_pong() -> Self {
        let link = Self::default();
        link.set_auto_pong(true);
        link
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        lock(&self.state).auto_pong = enabled;
    }

    /// The next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).failing_opens = count;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).events.is_some()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn ping_count(&self) -> usize {
        lock(&self.state).pings
    }

    pub fn close_codes(&self) -> Vec<u16> {
        lock(&self.state).closes.iter().map(|(code, _)| *code).collect()
    }

    /// Deliver an event on the current session. Returns false when no session is open.
    pub fn inject(&self, event: LinkEvent) -> bool {
        let sender = lock(&self.state).events.clone();
        match sender {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn inject_frame(&self, frame: Vec<u8>) -> bool {
        self.inject(LinkEvent::Frame(frame))
    }

    pub fn inject_message(&self, message: &Message) -> bool {
        match serde_json::to_vec(message) {
            Ok(frame) => self.inject_frame(frame),
            Err(_) => false,
        }
    }

    pub fn inject_ack(&self, ack: &Acknowledgment) -> bool {
        match serde_json::to_vec(ack) {
            Ok(frame) => self.inject_frame(frame),
            Err(_) => false,
        }
    }

    /// Simulate the peer going away
    pub fn drop_connection(&self, code: u16, reason: &str) -> bool {
        let delivered = self.inject(LinkEvent::Closed {
            code,
            reason: reason.to_string(),
        });
        lock(&self.state).events = None;
        delivered
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }

    /// Outbound messages in send order, with batches expanded
    pub fn sent_messages(&self) -> Vec<Message> {
        let codec = CompressionCodec::new(CompressionConfig::default());
        let mut messages = Vec::new();
        for frame in self.sent_frames() {
            match InboundFrame::parse(&frame) {
                Ok(InboundFrame::Batch(batch)) => {
                    if let Ok(expanded) = expand_batch(&batch, &codec) {
                        messages.extend(expanded);
                    }
                }
                Ok(InboundFrame::Message(message)) => messages.push(*message),
                _ => {}
            }
        }
        messages
    }

    pub fn sent_acks(&self) -> Vec<Acknowledgment> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| match InboundFrame::parse(frame) {
                Ok(InboundFrame::Ack(ack)) => Some(ack),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        let mut state = lock(&self.state);
        state.opens += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(LinkError::OpenFailed("scripted open failure".to_string()));
        }
        let (tx, rx) = mpsc::channel(256);
        state.events = Some(tx);
        Ok(rx)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if state.events.is_none() {
            return Err(LinkError::NotOpen);
        }
        if state.fail_sends {
            return Err(LinkError::SendFailed("scripted send failure".to_string()));
        }
        state.sent.push(frame);
        Ok(())
    }

    async fn ping(&self) -> Result<(), LinkError> {
        let (auto_pong, sender) = {
            let mut state = lock(&self.state);
            state.pings += 1;
            (state.auto_pong, state.events.clone())
        };
        match sender {
            Some(sender) => {
                if auto_pong {
                    let _ = sender.try_send(LinkEvent::Pong);
                }
                Ok(())
            }
            None => Err(LinkError::NotOpen),
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        state.closes.push((code, reason.to_string()));
        state.events = None;
        Ok(())
    }
}

/// [`CommandRouter`] that targets every listed device, or fails on demand
#[derive(Default)]
pub struct ScriptedRouter {
    fail: bool,
    delay: Option<Duration>,
}

impl ScriptedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            delay: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            fail: false,
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl CommandRouter for ScriptedRouter {
    async fn route(&self, command: &Command) -> Result<RoutePlan, StageError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(StageError::NoRoute("scripted routing failure".to_string()));
        }
        Ok(RoutePlan {
            strategy: RoutingStrategy::Broadcast,
            targets: command.target_device_ids.clone(),
            first_success: false,
        })
    }
}

/// [`CommandExecutor`] that records executions
///
/// Commands whose payload has `"fail": true` fail. A gated executor holds every execution until
/// [`ScriptedExecutor::release`] hands out a permit.
#[derive(Default)]
pub struct ScriptedExecutor {
    gate: Option<Semaphore>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Let `count` gated executions finish
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Ids of commands that started executing, in start order
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        command: &Command,
        plan: &RoutePlan,
    ) -> Result<CommandOutcome, StageError> {
        lock(&self.executed).push(command.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(StageError::Rejected("gate closed".to_string())),
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if command.payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(StageError::Rejected("scripted execution failure".to_string()));
        }
        Ok(CommandOutcome {
            result: json!({ "targets": plan.targets }),
        })
    }
}

/// [`MessageSender`] that records messages and answers with a scripted acknowledgment
pub struct RecordingSender {
    device: DeviceInfo,
    ack_status: Option<AckStatus>,
    fail: bool,
    sent: Mutex<Vec<Message>>,
}

impl RecordingSender {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            ack_status: Some(AckStatus::Processed),
            fail: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages that require an ack get this status back
    pub fn with_ack_status(mut self, status: AckStatus) -> Self {
        self.ack_status = Some(status);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    fn local_device(&self) -> &DeviceInfo {
        &self.device
    }

    async fn send(&self, message: Message) -> MeshResult<Option<Acknowledgment>> {
        if self.fail {
            return Err(MeshError::network("scripted send failure"));
        }
        let ack = match (message.requires_ack(), self.ack_status) {
            (true, Some(status)) => Some(Acknowledgment::new(message.id.clone(), status)),
            _ => None,
        };
        lock(&self.sent).push(message);
        Ok(ack)
    }
}

/// [`EventSink`] that records deliveries as `(subscription id, event id)`
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<(String, String)>>,
    failing_devices: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries to this device fail
    pub fn fail_device(&self, device_id: &str) {
        lock(&self.failing_devices).insert(device_id.to_string());
    }

    pub fn deliveries(&self) -> Vec<(String, String)> {
        lock(&self.deliveries).clone()
    }

    /// Event ids delivered to one subscription, in delivery order
    pub fn events_for(&self, subscription_id: &str) -> Vec<String> {
        lock(&self.deliveries)
            .iter()
            .filter(|(sub, _)| sub == subscription_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(
        &self,
        subscription: &EventSubscription,
        event: &RealTimeEvent,
    ) -> MeshResult<()> {
        if lock(&self.failing_devices).contains(&subscription.device_id) {
            return Err(MeshError::network(format!(
                "device {} unreachable",
                subscription.device_id
            )));
        }
        lock(&self.deliveries).push((subscription.id.clone(), event.id.clone()));
        Ok(())
    }
}
