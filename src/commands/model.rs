//! Command and command-queue value types

use crate::error::{MeshError, MeshResult};
use crate::protocol::{prefixed_id, validate_identifier, MessagePriority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    FileSync,
    FileUpload,
    FileDownload,
    FileDelete,
    DeviceHandoff,
    DeviceSync,
    DeviceStatus,
    MessageSend,
    MessageBroadcast,
    NotificationSend,
    SystemBackup,
    SystemRestore,
    SystemCleanup,
    Custom,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::FileSync => "file_sync",
            CommandType::FileUpload => "file_upload",
            CommandType::FileDownload => "file_download",
            CommandType::FileDelete => "file_delete",
            CommandType::DeviceHandoff => "device_handoff",
            CommandType::DeviceSync => "device_sync",
            CommandType::DeviceStatus => "device_status",
            CommandType::MessageSend => "message_send",
            CommandType::MessageBroadcast => "message_broadcast",
            CommandType::NotificationSend => "notification_send",
            CommandType::SystemBackup => "system_backup",
            CommandType::SystemRestore => "system_restore",
            CommandType::SystemCleanup => "system_cleanup",
            CommandType::Custom => "custom",
        }
    }
}

/// Higher value = more urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
    Emergency = 4,
}

impl CommandPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Wire priority used when the command is relayed as a message
    pub fn message_priority(&self) -> MessagePriority {
        match self {
            CommandPriority::Low => MessagePriority::Low,
            CommandPriority::Medium => MessagePriority::Normal,
            CommandPriority::High => MessagePriority::High,
            CommandPriority::Critical | CommandPriority::Emergency => MessagePriority::Critical,
        }
    }
}

/// Lifecycle of a command. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    #[default]
    Pending,
    Queued,
    Routing,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    fn rank(&self) -> u8 {
        match self {
            CommandStatus::Pending => 0,
            CommandStatus::Queued => 1,
            CommandStatus::Routing => 2,
            CommandStatus::Executing => 3,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Queued => "queued",
            CommandStatus::Routing => "routing",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Synchronous,
    #[default]
    Asynchronous,
    Streaming,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Direct,
    Broadcast,
    #[default]
    Optimal,
    Failover,
    LoadBalanced,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandConfig {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    /// Bound on each of the routing and execution stages, in milliseconds
    #[serde(default = "default_command_timeout_ms", rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms", rename = "retryDelay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_true")]
    pub cancellable: bool,
    #[serde(default = "default_true")]
    pub persistent: bool,
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            routing_strategy: RoutingStrategy::default(),
            timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: true,
            cancellable: true,
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    #[serde(default)]
    pub resource_requirements: HashMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTimestamps {
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub routing_started_at: Option<DateTime<Utc>>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for CommandTimestamps {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            queued_at: None,
            routing_started_at: None,
            execution_started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Which stage a command failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Routing,
    Execution,
    Timeout,
    Cancelled,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub cause: FailureCause,
    pub message: String,
}

impl CommandError {
    pub fn new<S: Into<String>>(cause: FailureCause, message: S) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

/// A unit of work addressed to one or more devices of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub user_id: String,
    pub source_device_id: String,
    pub target_device_ids: Vec<String>,
    #[serde(default)]
    pub priority: CommandPriority,
    #[serde(default)]
    pub status: CommandStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: CommandMetadata,
    #[serde(default)]
    pub config: CommandConfig,
    #[serde(default)]
    pub timestamps: CommandTimestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl Command {
    pub fn new(
        command_type: CommandType,
        user_id: impl Into<String>,
        source_device_id: impl Into<String>,
        target_device_ids: Vec<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: prefixed_id("cmd"),
            command_type,
            user_id: user_id.into(),
            source_device_id: source_device_id.into(),
            target_device_ids,
            priority: CommandPriority::default(),
            status: CommandStatus::Pending,
            payload,
            metadata: CommandMetadata::default(),
            config: CommandConfig::default(),
            timestamps: CommandTimestamps::default(),
            result: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: CommandConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn non_cancellable(mut self) -> Self {
        self.config.cancellable = false;
        self
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.id.trim().is_empty() {
            return Err(MeshError::validation("command id is required"));
        }
        validate_identifier(&self.user_id)
            .map_err(|e| MeshError::validation(format!("invalid userId: {e}")))?;
        validate_identifier(&self.source_device_id)
            .map_err(|e| MeshError::validation(format!("invalid sourceDeviceId: {e}")))?;
        if self.target_device_ids.is_empty() {
            return Err(MeshError::validation(
                "command needs at least one target device",
            ));
        }
        for target in &self.target_device_ids {
            validate_identifier(target)
                .map_err(|e| MeshError::validation(format!("invalid target device: {e}")))?;
        }
        Ok(())
    }

    /// Move to `to` if that is a forward transition; stamps the matching timestamp
    pub fn advance(&mut self, to: CommandStatus) -> bool {
        if self.status.is_terminal() || to.rank() <= self.status.rank() {
            return false;
        }

        let now = Utc::now();
        match to {
            CommandStatus::Queued => self.timestamps.queued_at = Some(now),
            CommandStatus::Routing => self.timestamps.routing_started_at = Some(now),
            CommandStatus::Executing => self.timestamps.execution_started_at = Some(now),
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled => {
                self.timestamps.completed_at = Some(now)
            }
            CommandStatus::Pending => {}
        }
        self.timestamps.updated_at = now;
        self.status = to;
        true
    }

    /// Time from the start of routing to the terminal state
    pub fn processing_time_ms(&self) -> Option<i64> {
        let started = self.timestamps.routing_started_at?;
        let finished = self.timestamps.completed_at?;
        Some((finished - started).num_milliseconds().max(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    #[default]
    Priority,
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoCleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Terminal commands older than this are deleted, in milliseconds
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_max_completed_commands")]
    pub max_completed_commands: usize,
}

fn default_max_age_ms() -> u64 {
    86_400_000
}

fn default_max_completed_commands() -> usize {
    1000
}

impl Default for AutoCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_ms: default_max_age_ms(),
            max_completed_commands: default_max_completed_commands(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandQueueConfig {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auto_cleanup: AutoCleanupConfig,
}

fn default_queue_max_size() -> usize {
    10_000
}

fn default_max_concurrency() -> usize {
    10
}

fn default_queue_timeout_ms() -> u64 {
    300_000
}

impl Default for CommandQueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            max_concurrency: default_max_concurrency(),
            processing_mode: ProcessingMode::default(),
            timeout_ms: default_queue_timeout_ms(),
            auto_cleanup: AutoCleanupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_processed: usize,
    pub average_processing_time_ms: f64,
    /// Commands finished in the last minute
    pub throughput: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQueueInfo {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub config: CommandQueueConfig,
    pub stats: QueueStats,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
}

/// Service-wide performance view
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPerformanceMetrics {
    pub total_commands: usize,
    pub commands_by_status: HashMap<String, usize>,
    pub commands_by_type: HashMap<String, usize>,
    pub average_processing_time_ms: f64,
    pub success_rate: f64,
    pub throughput: usize,
    pub active_queues: usize,
    pub total_queues: usize,
}
