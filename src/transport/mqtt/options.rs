//! Pure MQTT connection configuration

use crate::config::TransportSection;
use crate::protocol::{now_millis, DeviceInfo, TopicBuilder};
use crate::transport::LinkError;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde_json::json;
use std::time::Duration;
use url::Url;

/// Host, port and TLS flag of a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
pub fn broker_address(broker_url: &str) -> Result<BrokerAddress, LinkError> {
    let url = Url::parse(broker_url)
        .map_err(|_| LinkError::InvalidConfig(format!("invalid broker URL: {broker_url}")))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => {
            return Err(LinkError::InvalidConfig(format!(
                "unsupported broker scheme: {other}"
            )))
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| LinkError::InvalidConfig(format!("broker URL has no host: {broker_url}")))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress { host, port, tls })
}

/// Build options for one connection attempt of `device`
pub fn configure_mqtt_options(
    device: &DeviceInfo,
    config: &TransportSection,
) -> Result<MqttOptions, LinkError> {
    let address = broker_address(&config.broker_url)?;

    // Unique per attempt so a lingering session on the broker never collides
    let client_id = format!("device-{}-{}", device.device_id, now_millis());
    let mut mqtt_options = MqttOptions::new(client_id, address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(config.max_packet_size));

    let status_topic = TopicBuilder::status(&device.user_id, &device.device_id);
    let offline = json!({
        "deviceId": device.device_id,
        "userId": device.user_id,
        "status": "offline",
        "timestamp": now_millis(),
    });
    let lwt = LastWill::new(
        status_topic,
        offline.to_string(),
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_address_defaults() {
        assert_eq!(
            broker_address("mqtt://localhost").unwrap(),
            BrokerAddress {
                host: "localhost".to_string(),
                port: 1883,
                tls: false
            }
        );
        let secure = broker_address("mqtts://broker.example.com").unwrap();
        assert_eq!(secure.port, 8883);
        assert!(secure.tls);
    }

    #[test]
    fn test_broker_address_explicit_port() {
        assert_eq!(broker_address("mqtt://10.0.0.5:2883").unwrap().port, 2883);
    }

    #[test]
    fn test_broker_address_rejects_bad_urls() {
        assert!(matches!(
            broker_address("not a url"),
            Err(LinkError::InvalidConfig(_))
        ));
        assert!(matches!(
            broker_address("http://localhost:1883"),
            Err(LinkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = crate::config::MeshConfig::test_config();
        let options =
            configure_mqtt_options(&config.device_info(), &config.transport).unwrap();
        assert!(options.client_id().starts_with("device-test-device-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }
}
