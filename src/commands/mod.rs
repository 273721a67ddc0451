//! Command queueing and execution
//!
//! - [`model`] - Commands, queue configuration and statistics
//! - [`queue`] - Pending-command ordering
//! - [`stages`] - Pluggable routing and execution
//! - [`service`] - The [`CommandQueueService`]

pub mod model;
pub mod queue;
pub mod service;
pub mod stages;

pub use model::{
    AutoCleanupConfig, Command, CommandConfig, CommandError, CommandMetadata,
    CommandPerformanceMetrics, CommandPriority, CommandQueueConfig, CommandQueueInfo,
    CommandStatus, CommandTimestamps, CommandType, ExecutionMode, FailureCause, ProcessingMode,
    QueueStats, QueueStatus, RoutingStrategy,
};
pub use queue::PendingQueue;
pub use service::{CommandEvent, CommandQueueService, CommandServiceConfig};
pub use stages::{
    CommandExecutor, CommandOutcome, CommandRouter, RelayExecutor, RoutePlan, StageError,
    TargetRouter,
};
