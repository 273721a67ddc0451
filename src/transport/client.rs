//! Impure I/O operations for one device link
//!
//! [`ProtocolClient`] owns a [`Link`] and everything that happens on it: the handshake, the
//! heartbeat, backoff reconnection, the offline queue, batching, compression and
//! acknowledgment tracking. All decisions are delegated to the pure functions in
//! [`super::health_monitor`] and [`crate::pipeline`].

use super::connection::{
    new_connection_id, ConnectionMetrics, ConnectionQuality, ConnectionSnapshot, ConnectionState,
    HeartbeatConfig, NetworkMonitor, RetryConfig, HEARTBEAT_TIMEOUT_CLOSURE, NORMAL_CLOSURE,
};
use super::health_monitor::{
    ConnectionEvent, HealthMonitor, HeartbeatAction, HeartbeatTracker, ReconnectionDecision,
};
use super::{Link, LinkEvent, MessageSender, ABNORMAL_CLOSURE};
use crate::error::{ErrorCode, MeshError, MeshResult};
use crate::observability::metrics;
use crate::observer::ObserverRegistry;
use crate::pipeline::{
    encode_batch, expand_batch, BatchDecision, BatchSink, BatcherStats, BatchingConfig,
    CompressionCodec, CompressionConfig, MessageBatcher, MessageQueue, QueueConfig, QueueStats,
};
use crate::protocol::{
    now_millis, recover_message_id, Acknowledgment, Batch, DeviceInfo, InboundFrame, Message,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Settings for one protocol client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryConfig,
    pub batching: BatchingConfig,
    pub queue: QueueConfig,
    pub compression: CompressionConfig,
}

impl ClientConfig {
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
    pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::DEFAULT_CONNECT_TIMEOUT_MS,
            ack_timeout_ms: Self::DEFAULT_ACK_TIMEOUT_MS,
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            batching: BatchingConfig::default(),
            queue: QueueConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Notifications published by a [`ProtocolClient`]
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// An inbound message was handled
    Message(Message),
    /// An inbound batch was fully handled
    Batch { batch_id: String, message_count: usize },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Error(String),
    Reconnecting { attempt: u32, delay_ms: u64 },
    Reconnected { attempt: u32 },
}

/// Receives every inbound message; an error turns into a `failed` acknowledgment
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_message(&self, message: &Message) -> MeshResult<()>;
}

type AckWaiter = oneshot::Sender<MeshResult<Acknowledgment>>;

struct SessionStatus {
    connection_id: String,
    /// Incremented for every opened session; stale tasks compare against it
    session: u64,
    active: bool,
    session_started: Option<Instant>,
    session_start_time: Option<i64>,
    reconnect_attempts: u32,
    permanently_disconnected: bool,
    heartbeat: HeartbeatTracker,
    metrics: ConnectionMetrics,
    network: NetworkMonitor,
}

#[derive(Default)]
struct SessionTasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    flush_timer: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_session(&mut self) {
        for handle in [self.reader.take(), self.heartbeat.take()].into_iter().flatten() {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_session();
        for handle in [self.flush_timer.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

struct Pipeline {
    queue: MessageQueue,
    batcher: MessageBatcher,
}

struct Shared<L> {
    link: L,
    device: DeviceInfo,
    config: ClientConfig,
    codec: CompressionCodec,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    pipeline: Mutex<Pipeline>,
    pending_acks: StdMutex<HashMap<String, AckWaiter>>,
    status: StdMutex<SessionStatus>,
    tasks: StdMutex<SessionTasks>,
    handler: StdMutex<Option<Arc<dyn InboundHandler>>>,
    observers: ObserverRegistry<ClientEvent>,
    destroyed: AtomicBool,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleep for `delay_ms` unless shutdown is signalled first. Returns false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

/// Writes formed batches to the link
struct WireSink<'a, L> {
    shared: &'a Shared<L>,
}

#[async_trait]
impl<L: Link> BatchSink for WireSink<'_, L> {
    async fn send_batch(&self, batch: &Batch) -> MeshResult<()> {
        let span = crate::batch_span!(batch_id = %batch.id, messages = batch.messages.len());
        let encoded = span.in_scope(|| encode_batch(batch, &self.shared.codec))?;

        self.shared
            .link
            .send(encoded.frame)
            .await
            .map_err(|e| MeshError::network(e.to_string()))?;

        if let Some(compressed_len) = encoded.compressed_len {
            metrics().batch_compressed(encoded.original_len, compressed_len);
        }
        let count = batch.messages.len() as u64;
        metrics().batch_sent();
        metrics().messages_sent(count);
        lock(&self.shared.status).metrics.messages_sent += count;
        Ok(())
    }
}

impl<L: Link> Shared<L> {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn ensure_alive(&self) -> MeshResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(MeshError::invalid_state("protocol destroyed"));
        }
        Ok(())
    }

    fn transition(&self, to: ConnectionState) {
        let from = self.state_tx.send_replace(to);
        if from == to {
            return;
        }

        if from.is_connected() {
            let mut status = lock(&self.status);
            if let Some(started) = status.session_started.take() {
                status.metrics.total_uptime_ms += started.elapsed().as_millis() as u64;
            }
        }

        HealthMonitor::log_state_transition(&from, &to);
        self.observers
            .notify(&ClientEvent::StateChanged { from, to });
    }

    fn reject_waiters(&self, make_error: impl Fn() -> MeshError) {
        let waiters: Vec<AckWaiter> = lock(&self.pending_acks)
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), "rejecting outstanding acknowledgment waiters");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(make_error()));
        }
    }

    /// Perform the handshake and start a session
    async fn open_session(self: &Arc<Self>) -> MeshResult<()> {
        self.transition(HealthMonitor::determine_next_state(
            &ConnectionEvent::ConnectRequested,
        ));
        metrics().link_connection_attempt();

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let events = match tokio::time::timeout(timeout, self.link.open()).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                metrics().link_connection_failed();
                self.transition(HealthMonitor::determine_next_state(
                    &ConnectionEvent::HandshakeFailed(e.to_string()),
                ));
                return Err(MeshError::network(e.to_string()));
            }
            Err(_) => {
                metrics().link_connection_failed();
                self.transition(HealthMonitor::determine_next_state(
                    &ConnectionEvent::HandshakeFailed("timeout".to_string()),
                ));
                return Err(MeshError::timeout(format!(
                    "link handshake did not complete within {}ms",
                    self.config.connect_timeout_ms
                )));
            }
        };

        if self.destroyed.load(Ordering::SeqCst) {
            let _ = self.link.close(NORMAL_CLOSURE, "protocol destroyed").await;
            return Err(MeshError::invalid_state("protocol destroyed"));
        }

        let (session, connection_id) = {
            let mut status = lock(&self.status);
            status.session += 1;
            status.active = true;
            status.connection_id = new_connection_id();
            status.session_started = Some(Instant::now());
            status.session_start_time = Some(now_millis());
            status.reconnect_attempts = 0;
            status.permanently_disconnected = false;
            status.heartbeat = HeartbeatTracker::new(&self.config.heartbeat);
            status.network.is_online = true;
            status.network.quality = HealthMonitor::assess_connection_quality(
                true,
                status.metrics.average_latency_ms,
                status.metrics.reconnect_count,
            );
            (status.session, status.connection_id.clone())
        };

        metrics().link_connection_established();
        self.transition(HealthMonitor::determine_next_state(
            &ConnectionEvent::HandshakeSucceeded,
        ));
        info!(connection_id = %connection_id, device_id = %self.device.device_id, "session opened");

        {
            let reader = self.spawn_reader(events, session, &connection_id);
            let heartbeat = self.spawn_heartbeat(session);
            let mut tasks = lock(&self.tasks);
            tasks.reader = Some(reader);
            tasks.heartbeat = Some(heartbeat);
        }

        self.drain_offline_queue().await;
        Ok(())
    }

    /// Move buffered messages into the batcher and push everything out
    async fn drain_offline_queue(&self) {
        {
            let mut pipeline = self.pipeline.lock().await;
            let buffered = pipeline.queue.drain_all();
            if !buffered.is_empty() {
                info!(count = buffered.len(), "draining offline queue");
            }
            for message in buffered {
                pipeline.batcher.add(message);
            }
        }

        if let Err(e) = self.flush().await {
            warn!("flush after connect failed, messages stay pending: {}", e);
        }
    }

    /// Send every pending batch if connected. Returns the number of batches sent.
    async fn flush(&self) -> MeshResult<usize> {
        if !self.state().is_connected() {
            return Ok(0);
        }

        let mut pipeline = self.pipeline.lock().await;
        let sink = WireSink { shared: self };
        let result = pipeline.batcher.flush_into(&sink).await;
        drop(pipeline);

        if let Err(e) = &result {
            metrics().send_failed();
            self.observers.notify(&ClientEvent::Error(e.to_string()));
        }
        result
    }

    /// Buffer or batch one outbound message
    async fn submit(self: &Arc<Self>, message: Message) -> MeshResult<()> {
        let decision = {
            let mut pipeline = self.pipeline.lock().await;
            if !self.state().is_connected() {
                let message_id = message.id.clone();
                pipeline.queue.enqueue(message)?;
                metrics().message_buffered();
                debug!(message_id = %message_id, "link down, message buffered");
                return Ok(());
            }
            pipeline.batcher.add(message)
        };

        match decision {
            BatchDecision::Flush => {
                if let Err(e) = self.flush().await {
                    debug!("flush deferred until the link recovers: {}", e);
                }
            }
            BatchDecision::Wait {
                deadline,
                arm_timer: true,
            } => self.arm_flush_timer(deadline),
            BatchDecision::Wait { .. } => {}
        }
        Ok(())
    }

    fn arm_flush_timer(self: &Arc<Self>, deadline: Instant) {
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Err(e) = shared.flush().await {
                debug!("timed flush failed: {}", e);
            }
        });
        // The previous timer may be mid-flush; let it finish
        lock(&self.tasks).flush_timer = Some(handle);
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        session: u64,
        connection_id: &str,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let span = crate::connection_span!(connection_id = %connection_id);
        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        LinkEvent::Frame(bytes) => shared.handle_frame(&bytes).await,
                        LinkEvent::Pong => shared.handle_pong(),
                        LinkEvent::Closed { code, reason } => {
                            shared.handle_closed(session, code, &reason);
                            return;
                        }
                    }
                }
                shared.handle_closed(session, ABNORMAL_CLOSURE, "link event stream ended");
            }
            .instrument(span),
        )
    }

    fn spawn_heartbeat(self: &Arc<Self>, session: u64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let interval = Duration::from_millis(self.config.heartbeat.interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let action = lock(&shared.status).heartbeat.on_tick(Instant::now());
                match action {
                    HeartbeatAction::SendPing => {
                        metrics().heartbeat_sent();
                        if let Err(e) = shared.link.ping().await {
                            warn!("heartbeat ping failed: {}", e);
                        }
                    }
                    HeartbeatAction::ForceClose { missed } => {
                        metrics().heartbeat_missed();
                        if let Err(e) = shared
                            .link
                            .close(HEARTBEAT_TIMEOUT_CLOSURE, "heartbeat timeout")
                            .await
                        {
                            debug!("close after heartbeat timeout failed: {}", e);
                        }
                        shared.handle_closed(
                            session,
                            HEARTBEAT_TIMEOUT_CLOSURE,
                            &format!("{missed} heartbeats missed"),
                        );
                        return;
                    }
                }
            }
        })
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        match InboundFrame::parse(bytes) {
            Ok(InboundFrame::Batch(batch)) => self.handle_batch(batch).await,
            Ok(InboundFrame::Ack(ack)) => self.resolve_ack(ack),
            Ok(InboundFrame::Message(message)) => self.handle_message(*message).await,
            Err(e) => {
                metrics().protocol_error();
                let error = MeshError::protocol(format!("unparseable frame: {e}"));
                warn!("{}", error);
                self.observers.notify(&ClientEvent::Error(error.to_string()));

                if let Some(message_id) = recover_message_id(bytes) {
                    let ack = Acknowledgment::failed(
                        message_id,
                        error.to_ack_error_with_code(ErrorCode::ProtocolError),
                    );
                    self.send_ack(&ack).await;
                }
            }
        }
    }

    async fn handle_batch(&self, batch: Batch) {
        let messages = match expand_batch(&batch, &self.codec) {
            Ok(messages) => messages,
            Err(e) => {
                metrics().protocol_error();
                warn!(batch_id = %batch.id, "dropping undecodable batch: {}", e);
                self.observers.notify(&ClientEvent::Error(e.to_string()));
                return;
            }
        };

        metrics().batch_received();
        let message_count = messages.len();
        for message in messages {
            self.handle_message(message).await;
        }
        self.observers.notify(&ClientEvent::Batch {
            batch_id: batch.id,
            message_count,
        });
    }

    async fn handle_message(&self, message: Message) {
        lock(&self.status).metrics.messages_received += 1;
        metrics().message_received();

        let requires_ack = message.requires_ack();
        if requires_ack {
            self.send_ack(&Acknowledgment::received(&message.id)).await;
        }

        let handler = lock(&self.handler).clone();
        let result = match handler {
            Some(handler) => handler.handle_message(&message).await,
            None => Ok(()),
        };

        if requires_ack {
            let ack = match &result {
                Ok(()) => Acknowledgment::processed(&message.id),
                Err(e) => Acknowledgment::failed(
                    &message.id,
                    e.to_ack_error_with_code(ErrorCode::ProcessingError),
                ),
            };
            self.send_ack(&ack).await;
        }

        if let Err(e) = &result {
            warn!(message_id = %message.id, "inbound message handling failed: {}", e);
        }
        self.observers.notify(&ClientEvent::Message(message));
    }

    /// Acks bypass the batcher and are dropped while disconnected
    async fn send_ack(&self, ack: &Acknowledgment) {
        if !self.state().is_connected() {
            debug!(message_id = %ack.message_id, "link down, dropping acknowledgment");
            return;
        }
        match serde_json::to_vec(ack) {
            Ok(frame) => {
                if let Err(e) = self.link.send(frame).await {
                    warn!(message_id = %ack.message_id, "failed to send acknowledgment: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize acknowledgment: {}", e),
        }
    }

    /// Settle the waiter for a final ack; duplicates and unknown ids are ignored
    fn resolve_ack(&self, ack: Acknowledgment) {
        if !ack.is_final() {
            debug!(message_id = %ack.message_id, "peer received message");
            return;
        }
        let waiter = lock(&self.pending_acks).remove(&ack.message_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(ack));
            }
            None => debug!(message_id = %ack.message_id, "ack for unknown or settled message"),
        }
    }

    fn handle_pong(&self) {
        let mut status = lock(&self.status);
        if let Some(round_trip) = status.heartbeat.on_pong(Instant::now()) {
            status
                .metrics
                .record_latency(round_trip.as_secs_f64() * 1000.0);
            status.network.quality = HealthMonitor::assess_connection_quality(
                true,
                status.metrics.average_latency_ms,
                status.metrics.reconnect_count,
            );
        }
    }

    /// The session ended without an explicit disconnect
    fn handle_closed(self: &Arc<Self>, session: u64, code: u16, reason: &str) {
        {
            let mut status = lock(&self.status);
            if !status.active || status.session != session {
                return;
            }
            status.active = false;
            status.network.is_online = false;
            status.network.quality = ConnectionQuality::Critical;
        }
        lock(&self.tasks).abort_session();
        metrics().link_connection_lost();

        let event = match code {
            NORMAL_CLOSURE => ConnectionEvent::ClosedCleanly,
            HEARTBEAT_TIMEOUT_CLOSURE => ConnectionEvent::HeartbeatTimedOut,
            _ => ConnectionEvent::ConnectionLost(reason.to_string()),
        };
        warn!(code, reason, "device link closed");
        self.transition(HealthMonitor::determine_next_state(&event));
        self.reject_waiters(|| MeshError::network("connection lost"));

        if HealthMonitor::requires_reconnection(&event) && !self.destroyed.load(Ordering::SeqCst) {
            let handle = self.spawn_reconnect();
            lock(&self.tasks).reconnect = Some(handle);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_reconnection().await })
    }

    async fn run_reconnection(self: &Arc<Self>) {
        let shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let attempts = lock(&self.status).reconnect_attempts;
            let shutdown_requested =
                *shutdown_rx.borrow() || self.destroyed.load(Ordering::SeqCst);

            match HealthMonitor::should_attempt_reconnection(
                attempts,
                &self.config.retry,
                shutdown_requested,
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    {
                        let mut status = lock(&self.status);
                        status.reconnect_attempts = attempt;
                        status.metrics.reconnect_count += 1;
                    }
                    metrics().link_reconnect_attempt();
                    self.transition(HealthMonitor::determine_next_state(
                        &ConnectionEvent::ReconnectionStarted(attempt),
                    ));
                    self.observers
                        .notify(&ClientEvent::Reconnecting { attempt, delay_ms });
                    info!(
                        "Attempting reconnection {}/{} after {}ms delay",
                        attempt, self.config.retry.max_attempts, delay_ms
                    );

                    if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                        return;
                    }

                    match self.open_session().await {
                        Ok(()) => {
                            self.observers.notify(&ClientEvent::Reconnected { attempt });
                            return;
                        }
                        Err(e) => warn!(attempt, "reconnection attempt failed: {}", e),
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    debug!("reconnection abandoned, shutdown requested");
                    return;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    lock(&self.status).permanently_disconnected = true;
                    self.transition(HealthMonitor::determine_next_state(
                        &ConnectionEvent::ReconnectionExhausted,
                    ));
                    let message = format!("reconnection failed after {attempts} attempts");
                    error!("{}", message);
                    self.reject_waiters(|| MeshError::network_fatal(message.clone()));
                    self.observers
                        .notify(&ClientEvent::Error(MeshError::network_fatal(message).to_string()));
                    return;
                }
            }
        }
    }

    fn shutdown_now(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        lock(&self.tasks).abort_all();
    }
}

/// Client side of the device mesh protocol over one [`Link`]
pub struct ProtocolClient<L: Link> {
    shared: Arc<Shared<L>>,
}

impl<L: Link> ProtocolClient<L> {
    pub fn new(link: L, device: DeviceInfo, config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let status = SessionStatus {
            connection_id: new_connection_id(),
            session: 0,
            active: false,
            session_started: None,
            session_start_time: None,
            reconnect_attempts: 0,
            permanently_disconnected: false,
            heartbeat: HeartbeatTracker::new(&config.heartbeat),
            metrics: ConnectionMetrics::default(),
            network: NetworkMonitor::default(),
        };

        let shared = Shared {
            pipeline: Mutex::new(Pipeline {
                queue: MessageQueue::new(config.queue.clone()),
                batcher: MessageBatcher::new(config.batching.clone()),
            }),
            codec: CompressionCodec::new(config.compression.clone()),
            link,
            device,
            config,
            state_tx,
            shutdown_tx,
            pending_acks: StdMutex::new(HashMap::new()),
            status: StdMutex::new(status),
            tasks: StdMutex::new(SessionTasks::default()),
            handler: StdMutex::new(None),
            observers: ObserverRegistry::new(),
            destroyed: AtomicBool::new(false),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Route inbound messages to `handler`
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *lock(&self.shared.handler) = Some(handler);
    }

    pub fn observers(&self) -> &ObserverRegistry<ClientEvent> {
        &self.shared.observers
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.shared.device
    }

    pub fn link(&self) -> &L {
        &self.shared.link
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_send(&self.state())
    }

    /// True once reconnection gave up after `retry.max_attempts`
    pub fn is_permanently_disconnected(&self) -> bool {
        lock(&self.shared.status).permanently_disconnected
    }

    /// Open the link. Supersedes any pending reconnection.
    pub async fn connect(&self) -> MeshResult<()> {
        self.shared.ensure_alive()?;
        if self.is_connected() {
            return Ok(());
        }

        if let Some(handle) = lock(&self.shared.tasks).reconnect.take() {
            handle.abort();
        }
        {
            let mut status = lock(&self.shared.status);
            status.reconnect_attempts = 0;
            status.permanently_disconnected = false;
        }
        self.shared.open_session().await
    }

    /// Open the link, handing a failed first handshake to the backoff schedule
    ///
    /// Returns the first attempt's result. After an error, later attempts run in the background
    /// until one succeeds or `retry.max_attempts` is spent, at which point
    /// [`ProtocolClient::is_permanently_disconnected`] turns true.
    pub async fn connect_with_retry(&self) -> MeshResult<()> {
        let result = self.connect().await;
        if result.is_err() && !self.shared.destroyed.load(Ordering::SeqCst) {
            let handle = self.shared.spawn_reconnect();
            if let Some(previous) = lock(&self.shared.tasks).reconnect.replace(handle) {
                previous.abort();
            }
        }
        result
    }

    /// Close the link with the normal close code; no reconnection follows
    pub async fn disconnect(&self) -> MeshResult<()> {
        let was_active = {
            let mut status = lock(&self.shared.status);
            std::mem::replace(&mut status.active, false)
        };
        {
            let mut tasks = lock(&self.shared.tasks);
            tasks.abort_session();
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
        }

        if was_active {
            if let Err(e) = self.shared.link.close(NORMAL_CLOSURE, "client disconnect").await {
                warn!("link close failed: {}", e);
            }
            metrics().link_connection_lost();
        }

        self.shared.transition(HealthMonitor::determine_next_state(
            &ConnectionEvent::ClosedCleanly,
        ));
        self.shared
            .reject_waiters(|| MeshError::network_fatal("connection closed"));
        Ok(())
    }

    /// Send a message, buffering it while disconnected
    ///
    /// Messages that require an acknowledgment wait for a final ack (`processed`, `failed` or
    /// `expired`) up to the ack timeout; other messages return `Ok(None)` once accepted.
    pub async fn send_message(&self, message: Message) -> MeshResult<Option<Acknowledgment>> {
        self.shared.ensure_alive()?;

        let message_id = message.id.clone();
        let ack_rx = message.requires_ack().then(|| {
            let (tx, rx) = oneshot::channel();
            lock(&self.shared.pending_acks).insert(message_id.clone(), tx);
            rx
        });

        if let Err(e) = self.shared.submit(message).await {
            lock(&self.shared.pending_acks).remove(&message_id);
            return Err(e);
        }

        let Some(ack_rx) = ack_rx else {
            return Ok(None);
        };

        let timeout = Duration::from_millis(self.shared.config.ack_timeout_ms);
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(MeshError::invalid_state("acknowledgment waiter dropped")),
            Err(_) => {
                lock(&self.shared.pending_acks).remove(&message_id);
                Err(MeshError::timeout(format!(
                    "no acknowledgment for message {message_id} within {}ms",
                    self.shared.config.ack_timeout_ms
                )))
            }
        }
    }

    /// Send pending batches now. Returns the number of batches sent.
    pub async fn flush(&self) -> MeshResult<usize> {
        self.shared.flush().await
    }

    pub fn pending_ack_count(&self) -> usize {
        lock(&self.shared.pending_acks).len()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.shared.pipeline.lock().await.queue.stats()
    }

    pub async fn batcher_stats(&self) -> BatcherStats {
        self.shared.pipeline.lock().await.batcher.stats()
    }

    pub async fn update_batching_config(&self, config: BatchingConfig) -> MeshResult<()> {
        let flush_now = self
            .shared
            .pipeline
            .lock()
            .await
            .batcher
            .update_config(config);
        if flush_now {
            self.shared.flush().await?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.snapshot().metrics
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        let metrics = self.metrics();
        HealthMonitor::assess_connection_quality(
            self.is_connected(),
            metrics.average_latency_ms,
            metrics.reconnect_count,
        )
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state();
        let status = lock(&self.shared.status);
        let mut metrics = status.metrics.clone();
        if let Some(started) = status.session_started {
            metrics.total_uptime_ms += started.elapsed().as_millis() as u64;
        }

        ConnectionSnapshot {
            connection_id: status.connection_id.clone(),
            state,
            device: self.shared.device.clone(),
            session_start_time: status.session_start_time,
            network: status.network.clone(),
            metrics,
            permanently_disconnected: status.permanently_disconnected,
        }
    }

    /// Tear everything down: background tasks stop, waiters are rejected, buffers are discarded
    pub async fn destroy(&self) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let was_active = {
            let mut status = lock(&self.shared.status);
            std::mem::replace(&mut status.active, false)
        };
        self.shared.shutdown_now();

        if was_active {
            if let Err(e) = self
                .shared
                .link
                .close(NORMAL_CLOSURE, "protocol destroyed")
                .await
            {
                debug!("link close during destroy failed: {}", e);
            }
            metrics().link_connection_lost();
        }

        self.shared.transition(ConnectionState::Disconnected);
        self.shared
            .reject_waiters(|| MeshError::invalid_state("protocol destroyed"));
        {
            let mut pipeline = self.shared.pipeline.lock().await;
            pipeline.queue.destroy();
            pipeline.batcher.clear();
        }
        self.shared.observers.clear();
        info!(device_id = %self.shared.device.device_id, "protocol client destroyed");
    }
}

impl<L: Link> Drop for ProtocolClient<L> {
    fn drop(&mut self) {
        self.shared.shutdown_now();
        self.shared
            .reject_waiters(|| MeshError::invalid_state("protocol destroyed"));
    }
}

#[async_trait]
impl<L: Link> MessageSender for ProtocolClient<L> {
    fn local_device(&self) -> &DeviceInfo {
        &self.shared.device
    }

    async fn send(&self, message: Message) -> MeshResult<Option<Acknowledgment>> {
        self.send_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, 500).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let sleeper = tokio::spawn(interruptible_sleep(rx, 60_000));
        tx.send_replace(true);
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_interruptible_sleep_returns_immediately_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        assert!(!interruptible_sleep(rx, 60_000).await);
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.ack_timeout_ms, 30_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.retry.max_attempts, 10);
    }
}
