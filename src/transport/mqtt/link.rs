//! MQTT implementation of [`Link`]
//!
//! Every `open` builds a fresh client and event loop, waits for ConnAck and subscribes to the
//! device's inbound and pong topics. A background task polls the event loop and turns incoming
//! publishes into [`LinkEvent`]s.

use super::options::configure_mqtt_options;
use crate::config::TransportSection;
use crate::protocol::{now_millis, DeviceInfo, TopicBuilder};
use crate::transport::{Link, LinkError, LinkEvent, ABNORMAL_CLOSURE};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, EventLoop};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const REQUEST_CHANNEL_CAPACITY: usize = 10;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct DeviceTopics {
    outbound: String,
    inbound: String,
    ping: String,
    pong: String,
}

impl DeviceTopics {
    fn for_device(device: &DeviceInfo) -> Self {
        Self {
            outbound: TopicBuilder::outbound(&device.user_id, &device.device_id),
            inbound: TopicBuilder::inbound(&device.user_id, &device.device_id),
            ping: TopicBuilder::ping(&device.user_id, &device.device_id),
            pong: TopicBuilder::pong(&device.user_id, &device.device_id),
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    event_loop_task: JoinHandle<()>,
}

pub struct MqttLink {
    device: DeviceInfo,
    config: TransportSection,
    topics: DeviceTopics,
    session: Mutex<Option<MqttSession>>,
}

impl MqttLink {
    pub fn new(device: DeviceInfo, config: TransportSection) -> Self {
        let topics = DeviceTopics::for_device(&device);
        Self {
            device,
            config,
            topics,
            session: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<AsyncClient, LinkError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(LinkError::NotOpen)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        let client = self.client().await?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| LinkError::SendFailed(e.to_string()))
    }

    /// Poll until the broker acknowledges the connection
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), LinkError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(other) => debug!(target: "mqtt_transport", "pre-ConnAck event: {:?}", other),
                Err(e) => return Err(LinkError::OpenFailed(e.to_string())),
            }
        }
    }
}

/// Forward incoming publishes until the connection ends
async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    topics: DeviceTopics,
) {
    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                if publish.retain {
                    debug!(target: "mqtt_transport", topic = %topic, "ignoring retained message");
                    continue;
                }
                if topic == topics.inbound {
                    LinkEvent::Frame(publish.payload.to_vec())
                } else if topic == topics.pong {
                    LinkEvent::Pong
                } else {
                    debug!(
                        target: "mqtt_transport",
                        topic = %topic,
                        "ignoring message on unexpected topic"
                    );
                    continue;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => LinkEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "broker sent disconnect".to_string(),
            },
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                debug!(target: "mqtt_transport", packet_id = suback.pkid, "subscription confirmed");
                continue;
            }
            Ok(_) => continue,
            Err(e) => LinkEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: e.to_string(),
            },
        };

        let closed = matches!(event, LinkEvent::Closed { .. });
        if events.send(event).await.is_err() || closed {
            break;
        }
    }
    debug!(target: "mqtt_transport", "MQTT event loop stopped");
}

#[async_trait]
impl Link for MqttLink {
    async fn open(&self) -> Result<mpsc::Receiver<LinkEvent>, LinkError> {
        if let Some(previous) = self.session.lock().await.take() {
            previous.event_loop_task.abort();
        }

        let options = configure_mqtt_options(&self.device, &self.config)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Self::wait_for_connack(&mut event_loop).await?;

        for topic in [&self.topics.inbound, &self.topics.pong] {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| LinkError::OpenFailed(format!("subscribe to {topic} failed: {e}")))?;
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let event_loop_task = tokio::spawn(run_event_loop(event_loop, tx, self.topics.clone()));
        *self.session.lock().await = Some(MqttSession {
            client,
            event_loop_task,
        });

        info!(
            broker = %self.config.broker_url,
            inbound = %self.topics.inbound,
            "MQTT link open"
        );
        Ok(rx)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        self.publish(&self.topics.outbound, frame).await
    }

    async fn ping(&self) -> Result<(), LinkError> {
        let payload = serde_json::json!({ "timestamp": now_millis() }).to_string();
        self.publish(&self.topics.ping, payload.into_bytes()).await
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), LinkError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(LinkError::NotOpen);
        };

        debug!(target: "mqtt_transport", code, reason, "closing MQTT link");
        if let Err(e) = session.client.disconnect().await {
            warn!("MQTT disconnect request failed: {}", e);
        }
        // Give the event loop a moment to flush the disconnect packet
        if tokio::time::timeout(CLOSE_GRACE, &mut session.event_loop_task)
            .await
            .is_err()
        {
            session.event_loop_task.abort();
        }
        Ok(())
    }
}
