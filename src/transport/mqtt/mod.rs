//! MQTT device link
//!
//! - [`options`] - Pure broker URL parsing and connection options
//! - [`link`] - [`MqttLink`], the rumqttc-backed [`crate::transport::Link`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use devicemesh::config::MeshConfig;
//! use devicemesh::transport::mqtt::MqttLink;
//! use devicemesh::transport::{ClientConfig, ProtocolClient};
//!
//! # tokio_test::block_on(async {
//! let config = MeshConfig::load_from_file(std::path::Path::new("devicemesh.toml"))?;
//! let link = MqttLink::new(config.device_info(), config.transport.clone());
//! let client = ProtocolClient::new(link, config.device_info(), config.client_config());
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod link;
pub mod options;

pub use link::MqttLink;
pub use options::{broker_address, configure_mqtt_options, BrokerAddress};
