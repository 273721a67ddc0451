//! Pluggable routing and execution stages
//!
//! The service runs every command through a [`CommandRouter`] and then a [`CommandExecutor`].
//! [`TargetRouter`] and [`RelayExecutor`] are the shipped implementations: the router turns the
//! command's routing strategy into an ordered target list and the executor relays the command
//! to those devices as `command` wire messages.

use super::model::{Command, ExecutionMode, RoutingStrategy};
use crate::protocol::{AckStatus, Message, MessageDestination, MessageType};
use crate::transport::MessageSender;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a pluggable stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("No route: {0}")]
    NoRoute(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Where a command should go
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlan {
    pub strategy: RoutingStrategy,
    /// Targets in delivery order
    pub targets: Vec<String>,
    /// Stop after the first successful delivery
    pub first_success: bool,
}

/// What execution produced
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub result: Value,
}

#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn route(&self, command: &Command) -> Result<RoutePlan, StageError>;
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &Command,
        plan: &RoutePlan,
    ) -> Result<CommandOutcome, StageError>;
}

/// Routes over the command's own target list
///
/// - `direct`: the first target
/// - `broadcast`, `optimal`: every distinct target
/// - `failover`: every distinct target, stopping at the first success
/// - `load_balanced`, `round_robin`: one target, rotating across calls
#[derive(Debug, Default)]
pub struct TargetRouter {
    rotation: AtomicUsize,
}

impl TargetRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn distinct(targets: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(targets.len());
    for target in targets {
        if !seen.contains(target) {
            seen.push(target.clone());
        }
    }
    seen
}

#[async_trait]
impl CommandRouter for TargetRouter {
    async fn route(&self, command: &Command) -> Result<RoutePlan, StageError> {
        let targets = distinct(&command.target_device_ids);
        if targets.is_empty() {
            return Err(StageError::NoRoute(format!(
                "command {} has no targets",
                command.id
            )));
        }

        let strategy = command.config.routing_strategy;
        let (targets, first_success) = match strategy {
            RoutingStrategy::Direct => (vec![targets[0].clone()], false),
            RoutingStrategy::Broadcast | RoutingStrategy::Optimal => (targets, false),
            RoutingStrategy::Failover => (targets, true),
            RoutingStrategy::LoadBalanced | RoutingStrategy::RoundRobin => {
                let slot = self.rotation.fetch_add(1, Ordering::Relaxed) % targets.len();
                (vec![targets[slot].clone()], false)
            }
        };

        debug!(command_id = %command.id, ?strategy, ?targets, "command routed");
        Ok(RoutePlan {
            strategy,
            targets,
            first_success,
        })
    }
}

/// Delivers commands to their targets over the mesh
pub struct RelayExecutor {
    sender: Arc<dyn MessageSender>,
}

impl RelayExecutor {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    fn relay_message(&self, command: &Command, target: &str) -> Result<Message, StageError> {
        let payload = serde_json::to_value(command)
            .map_err(|e| StageError::Rejected(format!("command not serializable: {e}")))?;
        let message = Message::new(
            self.sender.local_device().source(),
            MessageDestination::device(target),
            MessageType::Command,
            payload,
        )
        .with_priority(command.priority.message_priority());

        Ok(match command.config.execution_mode {
            ExecutionMode::Synchronous => message.requiring_ack(),
            _ => message,
        })
    }
}

#[async_trait]
impl CommandExecutor for RelayExecutor {
    async fn execute(
        &self,
        command: &Command,
        plan: &RoutePlan,
    ) -> Result<CommandOutcome, StageError> {
        let mut delivered = Vec::new();
        let mut failures = Vec::new();

        for target in &plan.targets {
            let message = self.relay_message(command, target)?;
            match self.sender.send(message).await {
                Ok(Some(ack)) if ack.status != AckStatus::Processed => {
                    let reason = ack
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| format!("{:?}", ack.status));
                    failures.push(format!("{target}: {reason}"));
                }
                Ok(_) => {
                    delivered.push(target.clone());
                    if plan.first_success {
                        break;
                    }
                }
                Err(e) => {
                    warn!(command_id = %command.id, target = %target, "relay failed: {}", e);
                    failures.push(format!("{target}: {e}"));
                }
            }
        }

        if delivered.is_empty() {
            return Err(StageError::Delivery(failures.join("; ")));
        }

        Ok(CommandOutcome {
            result: json!({
                "deliveredTo": delivered,
                "failures": failures,
            }),
        })
    }
}
