//! Configuration system for a devicemesh node
//!
//! One TOML file configures the local device identity, the link to the broker and every
//! component of the sync core. Every field has a default except the device identity and the
//! broker URL. Credentials are never stored in the file; the file names the environment
//! variables that hold them.

use crate::commands::CommandServiceConfig;
use crate::events::EventServiceConfig;
use crate::pipeline::{BatchingConfig, CompressionConfig, QueueConfig};
use crate::protocol::{validate_identifier, DeviceCapabilities, DeviceInfo, DeviceType};
use crate::transport::{ClientConfig, HealthMonitor, HeartbeatConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    pub device: DeviceSection,
    pub transport: TransportSection,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub commands: CommandServiceConfig,
    #[serde(default)]
    pub events: EventServiceConfig,
    #[serde(default)]
    pub health: HealthSection,
}

/// Identity of the local device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Owning user (must match [a-zA-Z0-9._-]+)
    pub user_id: String,
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_device_type() -> DeviceType {
    DeviceType::Desktop
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

/// Broker link settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Broker URL, `mqtt://` or `mqtts://`
    pub broker_url: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_connect_timeout_ms() -> u64 {
    ClientConfig::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_ack_timeout_ms() -> u64 {
    ClientConfig::DEFAULT_ACK_TIMEOUT_MS
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

impl TransportSection {
    /// Username from the configured environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Password from the configured environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

/// HTTP health endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid identifier '{id}': {reason}")]
    InvalidIdentifier { id: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

impl MeshConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the resolved configuration, defaults included
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id(&self.device.id)?;
        validate_id(&self.device.user_id)?;

        Url::parse(&self.transport.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "broker_url '{}' is not a valid URL: {e}",
                self.transport.broker_url
            ))
        })?;

        HealthMonitor::validate_retry_config(&self.retry).map_err(ConfigError::InvalidConfig)?;
        HealthMonitor::validate_heartbeat_config(&self.heartbeat)
            .map_err(ConfigError::InvalidConfig)?;

        require_positive("transport.connect_timeout_ms", self.transport.connect_timeout_ms)?;
        require_positive("transport.ack_timeout_ms", self.transport.ack_timeout_ms)?;
        require_positive("queue.max_size", self.queue.max_size as u64)?;
        require_positive("batching.max_size", self.batching.max_size as u64)?;
        require_positive(
            "commands.default_queue.max_size",
            self.commands.default_queue.max_size as u64,
        )?;
        require_positive(
            "commands.default_queue.max_concurrency",
            self.commands.default_queue.max_concurrency as u64,
        )?;
        require_positive("events.tier_capacity", self.events.tier_capacity as u64)?;
        require_positive(
            "compression.max_decompressed_size",
            self.compression.max_decompressed_size as u64,
        )?;
        require_positive(
            "events.max_concurrent_deliveries",
            self.events.max_concurrent_deliveries as u64,
        )?;

        if self.compression.level > 11 {
            return Err(ConfigError::InvalidConfig(format!(
                "compression.level must be between 0 and 11, got {}",
                self.compression.level
            )));
        }

        Ok(())
    }

    /// Identity used as the source of every outbound message
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device.id.clone(),
            user_id: self.device.user_id.clone(),
            device_type: self.device.device_type,
            platform: self.device.platform.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: DeviceCapabilities {
                supports_compression: self.compression.enabled,
                supports_batching: self.batching.enabled,
                features: self.device.features.clone(),
                ..Default::default()
            },
        }
    }

    /// Protocol client settings assembled from the relevant sections
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout_ms: self.transport.connect_timeout_ms,
            ack_timeout_ms: self.transport.ack_timeout_ms,
            heartbeat: self.heartbeat.clone(),
            retry: self.retry.clone(),
            batching: self.batching.clone(),
            queue: self.queue.clone(),
            compression: CompressionConfig {
                max_decompressed_size: self
                    .compression
                    .max_decompressed_size
                    .min(self.transport.max_packet_size as usize),
                ..self.compression.clone()
            },
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"
user_id = "test-user"

[transport]
broker_url = "mqtt://localhost:1883"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

fn validate_id(id: &str) -> Result<(), ConfigError> {
    validate_identifier(id).map_err(|e| ConfigError::InvalidIdentifier {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ProcessingMode;
    use crate::events::DrainPolicy;
    use crate::protocol::CompressionType;
    use crate::transport::BackoffStrategy;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = MeshConfig::test_config();

        assert_eq!(config.device.device_type, DeviceType::Desktop);
        assert_eq!(config.transport.connect_timeout_ms, 10_000);
        assert_eq!(config.transport.ack_timeout_ms, 30_000);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.heartbeat.max_missed, 3);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.batching.max_size, 10);
        assert_eq!(config.queue.max_size, 1000);
        assert_eq!(
            config.compression.algorithms,
            vec![CompressionType::Gzip, CompressionType::Brotli]
        );
        assert_eq!(config.commands.default_queue.max_concurrency, 10);
        assert_eq!(
            config.commands.default_queue.processing_mode,
            ProcessingMode::Priority
        );
        assert_eq!(config.events.tier_capacity, 10_000);
        assert_eq!(config.events.drain_policy, DrainPolicy::Strict);
        assert_eq!(config.health.port, 8080);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
id = "laptop.main"
user_id = "alice"
device_type = "tablet"
features = ["files"]

[transport]
broker_url = "mqtts://broker.example.com"
username_env = "MESH_USER"
password_env = "MESH_PASS"
ack_timeout_ms = 5000

[retry]
max_attempts = 4
base_delay_ms = 500
max_delay_ms = 4000
backoff_strategy = "linear"
jitter = false

[batching]
enabled = false

[commands]
cleanup_interval_ms = 1000

[commands.default_queue]
max_concurrency = 2
processing_mode = "fifo"

[events]
tier_capacity = 50

[events.drain_policy]
mode = "weighted"

[health]
enabled = false
"#;

        let config = MeshConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.device.device_type, DeviceType::Tablet);
        assert_eq!(config.retry.backoff_strategy, BackoffStrategy::Linear);
        assert!(!config.batching.enabled);
        assert_eq!(config.commands.default_queue.max_concurrency, 2);
        assert_eq!(
            config.commands.default_queue.processing_mode,
            ProcessingMode::Fifo
        );
        assert!(matches!(config.events.drain_policy, DrainPolicy::Weighted { .. }));
        assert!(!config.health.enabled);

        let client = config.client_config();
        assert_eq!(client.ack_timeout_ms, 5000);
        assert_eq!(client.retry.max_attempts, 4);

        let device = config.device_info();
        assert_eq!(device.device_id, "laptop.main");
        assert!(!device.capabilities.supports_batching);
        assert_eq!(device.capabilities.features, vec!["files".to_string()]);
    }

    #[test]
    fn test_invalid_device_id() {
        let toml_content = r#"
[device]
id = "bad device"
user_id = "alice"

[transport]
broker_url = "mqtt://localhost"
"#;
        assert!(matches!(
            MeshConfig::from_toml_str(toml_content),
            Err(ConfigError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_invalid_retry_bounds() {
        let toml_content = r#"
[device]
id = "d"
user_id = "u"

[transport]
broker_url = "mqtt://localhost"

[retry]
base_delay_ms = 5000
max_delay_ms = 1000
"#;
        assert!(matches!(
            MeshConfig::from_toml_str(toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = MeshConfig::test_config();
        config.queue.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::test_config();
        config.events.tier_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::test_config();
        config.events.max_concurrent_deliveries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_broker_url() {
        let mut config = MeshConfig::test_config();
        config.transport.broker_url = "::not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_credentials_from_env() {
        let mut config = MeshConfig::test_config();
        config.transport.username_env = Some("DEVICEMESH_TEST_USERNAME_ONLY".to_string());
        std::env::set_var("DEVICEMESH_TEST_USERNAME_ONLY", "alice");

        assert_eq!(config.transport.username(), Some("alice".to_string()));
        assert_eq!(config.transport.password(), None);
    }

    #[test]
    fn test_rendered_config_reloads() {
        let config = MeshConfig::test_config();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(MeshConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
