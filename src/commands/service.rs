//! Command queue service
//!
//! Per-user command queues with priority dispatch, bounded concurrency and lifecycle tracking.
//! Every command runs `Queued -> Routing -> Executing -> Completed | Failed` through the
//! configured [`CommandRouter`] and [`CommandExecutor`], each stage bounded by the command's
//! timeout. All bookkeeping lives behind one lock that is never held across an await.

use super::model::{
    Command, CommandError, CommandPerformanceMetrics, CommandQueueConfig, CommandQueueInfo,
    CommandStatus, FailureCause, QueueStats, QueueStatus,
};
use super::queue::PendingQueue;
use super::stages::{CommandExecutor, CommandOutcome, CommandRouter};
use crate::error::{MeshError, MeshResult};
use crate::observability::metrics;
use crate::observer::ObserverRegistry;
use crate::protocol::validate_identifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandServiceConfig {
    /// Configuration for queues created without an explicit one
    #[serde(default)]
    pub default_queue: CommandQueueConfig,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
}

fn default_cleanup_interval_ms() -> u64 {
    3_600_000
}

fn default_metrics_interval_ms() -> u64 {
    60_000
}

impl Default for CommandServiceConfig {
    fn default() -> Self {
        Self {
            default_queue: CommandQueueConfig::default(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
        }
    }
}

/// Notifications published by the [`CommandQueueService`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    QueueCreated(CommandQueueInfo),
    QueueStarted { queue_id: String },
    QueuePaused { queue_id: String },
    QueueStopped { queue_id: String },
    QueueDeleted { queue_id: String },
    CommandQueued(Command),
    CommandRouting(Command),
    CommandExecuting(Command),
    CommandCompleted(Command),
    CommandFailed(Command),
    CommandCancelled(Command),
    PerformanceMetrics(CommandPerformanceMetrics),
}

const DEFAULT_QUEUE_NAME: &str = "default";
const THROUGHPUT_WINDOW_SECS: i64 = 60;

struct QueueEntry {
    id: String,
    name: String,
    user_id: String,
    config: CommandQueueConfig,
    status: QueueStatus,
    created_at: DateTime<Utc>,
    pending: PendingQueue,
    executing: HashSet<String>,
}

#[derive(Default)]
struct ServiceState {
    queues: HashMap<String, QueueEntry>,
    /// Default queue id per user
    default_queues: HashMap<String, String>,
    commands: HashMap<String, Command>,
    /// Owning queue id per command
    command_queues: HashMap<String, String>,
    running: HashMap<String, JoinHandle<()>>,
    shut_down: bool,
}

#[derive(Default)]
struct Tally {
    completed: usize,
    failed: usize,
    cancelled: usize,
    timed: usize,
    total_time_ms: i64,
    recent: usize,
}

impl Tally {
    fn add(&mut self, command: &Command, recent_cutoff: DateTime<Utc>) {
        match command.status {
            CommandStatus::Completed => self.completed += 1,
            CommandStatus::Failed => self.failed += 1,
            CommandStatus::Cancelled => {
                self.cancelled += 1;
                return;
            }
            _ => return,
        }
        if let Some(elapsed) = command.processing_time_ms() {
            self.total_time_ms += elapsed;
            self.timed += 1;
        }
        if command
            .timestamps
            .completed_at
            .is_some_and(|at| at >= recent_cutoff)
        {
            self.recent += 1;
        }
    }

    fn processed(&self) -> usize {
        self.completed + self.failed
    }

    fn average_time_ms(&self) -> f64 {
        if self.timed == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.timed as f64
        }
    }

    fn success_rate(&self) -> f64 {
        if self.processed() == 0 {
            0.0
        } else {
            self.completed as f64 / self.processed() as f64
        }
    }
}

impl ServiceState {
    fn queue_stats(&self, queue: &QueueEntry) -> QueueStats {
        let cutoff = Utc::now() - chrono::Duration::seconds(THROUGHPUT_WINDOW_SECS);
        let mut tally = Tally::default();
        for (command_id, queue_id) in &self.command_queues {
            if *queue_id != queue.id {
                continue;
            }
            if let Some(command) = self.commands.get(command_id) {
                tally.add(command, cutoff);
            }
        }

        QueueStats {
            queued: queue.pending.len(),
            executing: queue.executing.len(),
            completed: tally.completed,
            failed: tally.failed,
            cancelled: tally.cancelled,
            total_processed: tally.processed(),
            average_processing_time_ms: tally.average_time_ms(),
            throughput: tally.recent,
            success_rate: tally.success_rate(),
        }
    }

    fn queue_info(&self, queue_id: &str) -> Option<CommandQueueInfo> {
        let queue = self.queues.get(queue_id)?;
        Some(CommandQueueInfo {
            id: queue.id.clone(),
            name: queue.name.clone(),
            user_id: queue.user_id.clone(),
            config: queue.config.clone(),
            stats: self.queue_stats(queue),
            status: queue.status,
            created_at: queue.created_at,
        })
    }

    fn insert_queue(&mut self, user_id: &str, name: &str, config: CommandQueueConfig) -> String {
        let id = format!("queue_{}", Uuid::new_v4().simple());
        let entry = QueueEntry {
            id: id.clone(),
            name: name.to_string(),
            user_id: user_id.to_string(),
            pending: PendingQueue::new(config.processing_mode),
            config,
            status: QueueStatus::Active,
            created_at: Utc::now(),
            executing: HashSet::new(),
        };
        self.queues.insert(id.clone(), entry);
        id
    }

    /// Cancel every pending command of a queue; non-cancellable ones stay unless `force`
    fn cancel_pending(&mut self, queue_id: &str, reason: &str, force: bool) -> Vec<Command> {
        let ServiceState {
            queues, commands, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_id) else {
            return Vec::new();
        };

        let mut cancelled = Vec::new();
        for command_id in queue.pending.drain() {
            let Some(command) = commands.get_mut(&command_id) else {
                continue;
            };
            if !force && !command.config.cancellable {
                queue.pending.push(command_id, command.priority);
                continue;
            }
            command.error = Some(CommandError::new(FailureCause::Cancelled, reason));
            if command.advance(CommandStatus::Cancelled) {
                cancelled.push(command.clone());
            }
        }
        cancelled
    }
}

struct Inner {
    config: CommandServiceConfig,
    router: Arc<dyn CommandRouter>,
    executor: Arc<dyn CommandExecutor>,
    state: Mutex<ServiceState>,
    observers: ObserverRegistry<CommandEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    /// Start as many pending commands as the queue's concurrency allows
    fn pump(self: &Arc<Self>, queue_id: &str) {
        let mut state = lock(&self.state);
        let ServiceState {
            queues,
            commands,
            running,
            ..
        } = &mut *state;

        let Some(queue) = queues.get_mut(queue_id) else {
            return;
        };

        while queue.status == QueueStatus::Active
            && queue.executing.len() < queue.config.max_concurrency.max(1)
        {
            let Some(command_id) = queue.pending.pop() else {
                break;
            };
            let Some(command) = commands.get_mut(&command_id) else {
                continue;
            };
            if !command.advance(CommandStatus::Routing) {
                continue;
            }

            queue.executing.insert(command_id.clone());
            // The queue timeout caps every stage of its commands
            let timeout_ms = command.config.timeout_ms.min(queue.config.timeout_ms);
            let span = crate::command_span!(command_id = %command_id, queue_id = %queue_id);
            let handle = tokio::spawn(
                Arc::clone(self)
                    .run_command(queue_id.to_string(), command.clone(), timeout_ms)
                    .instrument(span),
            );
            running.insert(command_id, handle);
        }
    }

    async fn run_command(self: Arc<Self>, queue_id: String, command: Command, timeout_ms: u64) {
        let started = Instant::now();
        self.observers
            .notify(&CommandEvent::CommandRouting(command.clone()));
        debug!(command_type = command.command_type.as_str(), "routing command");

        let stage_timeout = Duration::from_millis(timeout_ms);
        let plan = match tokio::time::timeout(stage_timeout, self.router.route(&command)).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                let error = CommandError::new(FailureCause::Routing, e.to_string());
                return self.finish(&queue_id, &command.id, Err(error), started);
            }
            Err(_) => {
                let error = CommandError::new(
                    FailureCause::Timeout,
                    format!("routing timed out after {timeout_ms}ms"),
                );
                return self.finish(&queue_id, &command.id, Err(error), started);
            }
        };

        let Some(command) = self.begin_execution(&command.id) else {
            return;
        };
        self.observers
            .notify(&CommandEvent::CommandExecuting(command.clone()));
        debug!(targets = ?plan.targets, "executing command");

        let outcome =
            match tokio::time::timeout(stage_timeout, self.executor.execute(&command, &plan)).await
            {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(CommandError::new(FailureCause::Execution, e.to_string())),
                Err(_) => Err(CommandError::new(
                    FailureCause::Timeout,
                    format!("execution timed out after {timeout_ms}ms"),
                )),
            };
        self.finish(&queue_id, &command.id, outcome, started);
    }

    fn begin_execution(&self, command_id: &str) -> Option<Command> {
        let mut state = lock(&self.state);
        let command = state.commands.get_mut(command_id)?;
        command
            .advance(CommandStatus::Executing)
            .then(|| command.clone())
    }

    fn finish(
        self: &Arc<Self>,
        queue_id: &str,
        command_id: &str,
        outcome: Result<CommandOutcome, CommandError>,
        started: Instant,
    ) {
        let finished = {
            let mut state = lock(&self.state);
            state.running.remove(command_id);
            if let Some(queue) = state.queues.get_mut(queue_id) {
                queue.executing.remove(command_id);
            }

            match state.commands.get_mut(command_id) {
                // Cancelled while a stage was running
                Some(command) if command.status.is_terminal() => None,
                Some(command) => {
                    match outcome {
                        Ok(outcome) => {
                            command.result = Some(outcome.result);
                            command.advance(CommandStatus::Completed);
                        }
                        Err(error) => {
                            command.error = Some(error);
                            command.advance(CommandStatus::Failed);
                        }
                    }
                    Some(command.clone())
                }
                None => None,
            }
        };

        if let Some(command) = finished {
            let elapsed = started.elapsed();
            if command.status == CommandStatus::Completed {
                metrics().command_completed(elapsed);
                info!(elapsed_ms = elapsed.as_millis() as u64, "command completed");
                self.observers
                    .notify(&CommandEvent::CommandCompleted(command));
            } else {
                metrics().command_failed(elapsed);
                if let Some(error) = &command.error {
                    warn!(cause = ?error.cause, "command failed: {}", error.message);
                }
                self.observers.notify(&CommandEvent::CommandFailed(command));
            }
        }

        self.pump(queue_id);
    }

    fn performance_metrics(&self) -> CommandPerformanceMetrics {
        let state = lock(&self.state);
        let cutoff = Utc::now() - chrono::Duration::seconds(THROUGHPUT_WINDOW_SECS);

        let mut snapshot = CommandPerformanceMetrics {
            total_commands: state.commands.len(),
            total_queues: state.queues.len(),
            active_queues: state
                .queues
                .values()
                .filter(|q| q.status == QueueStatus::Active)
                .count(),
            ..Default::default()
        };

        let mut tally = Tally::default();
        for command in state.commands.values() {
            *snapshot
                .commands_by_status
                .entry(command.status.as_str().to_string())
                .or_default() += 1;
            *snapshot
                .commands_by_type
                .entry(command.command_type.as_str().to_string())
                .or_default() += 1;
            tally.add(command, cutoff);
        }

        snapshot.average_processing_time_ms = tally.average_time_ms();
        snapshot.success_rate = tally.success_rate();
        snapshot.throughput = tally.recent;
        snapshot
    }

    /// Delete expired terminal commands and cap how many each queue retains
    fn cleanup(&self) -> usize {
        let mut state = lock(&self.state);
        let now = Utc::now();

        let mut finished_by_queue: HashMap<String, Vec<(DateTime<Utc>, String)>> = HashMap::new();
        for (id, command) in &state.commands {
            if !command.status.is_terminal() {
                continue;
            }
            let queue_id = state.command_queues.get(id).cloned().unwrap_or_default();
            let finished_at = command
                .timestamps
                .completed_at
                .unwrap_or(command.timestamps.updated_at);
            finished_by_queue
                .entry(queue_id)
                .or_default()
                .push((finished_at, id.clone()));
        }

        let mut doomed = Vec::new();
        for (queue_id, mut finished) in finished_by_queue {
            let policy = state
                .queues
                .get(&queue_id)
                .map(|q| q.config.auto_cleanup.clone())
                .unwrap_or_else(|| self.config.default_queue.auto_cleanup.clone());
            if !policy.enabled {
                continue;
            }

            let cutoff = now - chrono::Duration::milliseconds(policy.max_age_ms as i64);
            finished.sort_by(|a, b| b.0.cmp(&a.0));
            for (index, (finished_at, id)) in finished.into_iter().enumerate() {
                if finished_at < cutoff || index >= policy.max_completed_commands {
                    doomed.push(id);
                }
            }
        }

        for id in &doomed {
            state.commands.remove(id);
            state.command_queues.remove(id);
        }
        doomed.len()
    }

    fn set_queue_status(self: &Arc<Self>, queue_id: &str, status: QueueStatus) -> MeshResult<()> {
        {
            let mut state = lock(&self.state);
            let queue = state
                .queues
                .get_mut(queue_id)
                .ok_or_else(|| MeshError::not_found(format!("queue {queue_id}")))?;
            queue.status = status;
        }

        let queue_id = queue_id.to_string();
        let event = match status {
            QueueStatus::Active => CommandEvent::QueueStarted { queue_id },
            QueueStatus::Paused => CommandEvent::QueuePaused { queue_id },
            QueueStatus::Stopped => CommandEvent::QueueStopped { queue_id },
        };
        self.observers.notify(&event);
        Ok(())
    }
}

/// Per-user command queues with pluggable routing and execution
pub struct CommandQueueService {
    inner: Arc<Inner>,
}

impl CommandQueueService {
    pub fn new(
        config: CommandServiceConfig,
        router: Arc<dyn CommandRouter>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                router,
                executor,
                state: Mutex::new(ServiceState::default()),
                observers: ObserverRegistry::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn observers(&self) -> &ObserverRegistry<CommandEvent> {
        &self.inner.observers
    }

    pub fn config(&self) -> &CommandServiceConfig {
        &self.inner.config
    }

    /// Start the cleanup and metrics schedules. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if !tasks.is_empty() {
            return;
        }

        let cleanup_every = Duration::from_millis(self.inner.config.cleanup_interval_ms.max(1));
        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + cleanup_every, cleanup_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = inner.cleanup();
                if removed > 0 {
                    info!(removed, "cleaned up finished commands");
                }
            }
        }));

        let metrics_every = Duration::from_millis(self.inner.config.metrics_interval_ms.max(1));
        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + metrics_every, metrics_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = inner.performance_metrics();
                debug!(
                    total = snapshot.total_commands,
                    success_rate = snapshot.success_rate,
                    "command metrics updated"
                );
                inner
                    .observers
                    .notify(&CommandEvent::PerformanceMetrics(snapshot));
            }
        }));

        info!("command queue service started");
    }

    pub fn create_queue(
        &self,
        user_id: &str,
        name: &str,
        config: Option<CommandQueueConfig>,
    ) -> MeshResult<CommandQueueInfo> {
        validate_identifier(user_id)
            .map_err(|e| MeshError::validation(format!("invalid userId: {e}")))?;
        if name.trim().is_empty() {
            return Err(MeshError::validation("queue name is required"));
        }

        let info = {
            let mut state = lock(&self.inner.state);
            if state.shut_down {
                return Err(MeshError::invalid_state("command service is shut down"));
            }
            let config = config.unwrap_or_else(|| self.inner.config.default_queue.clone());
            let id = state.insert_queue(user_id, name, config);
            state.default_queues.entry(user_id.to_string()).or_insert(id.clone());
            state
                .queue_info(&id)
                .ok_or_else(|| MeshError::not_found(format!("queue {id}")))?
        };

        info!(queue_id = %info.id, user_id, name, "command queue created");
        self.inner
            .observers
            .notify(&CommandEvent::QueueCreated(info.clone()));
        Ok(info)
    }

    /// Stop the queue, cancel everything pending in it and forget it
    pub fn delete_queue(&self, queue_id: &str) -> MeshResult<()> {
        self.inner.set_queue_status(queue_id, QueueStatus::Stopped)?;

        let cancelled = {
            let mut state = lock(&self.inner.state);
            let cancelled = state.cancel_pending(queue_id, "queue deleted", true);
            state.queues.remove(queue_id);
            state.default_queues.retain(|_, id| id != queue_id);
            cancelled
        };

        for command in cancelled {
            metrics().command_cancelled();
            self.inner
                .observers
                .notify(&CommandEvent::CommandCancelled(command));
        }
        info!(queue_id, "command queue deleted");
        self.inner.observers.notify(&CommandEvent::QueueDeleted {
            queue_id: queue_id.to_string(),
        });
        Ok(())
    }

    pub fn get_queue(&self, queue_id: &str) -> Option<CommandQueueInfo> {
        lock(&self.inner.state).queue_info(queue_id)
    }

    pub fn list_queues(&self, user_id: &str) -> Vec<CommandQueueInfo> {
        let state = lock(&self.inner.state);
        let mut queues: Vec<CommandQueueInfo> = state
            .queues
            .values()
            .filter(|q| q.user_id == user_id)
            .filter_map(|q| state.queue_info(&q.id))
            .collect();
        queues.sort_by_key(|q| q.created_at);
        queues
    }

    pub fn get_queue_status(&self, queue_id: &str) -> MeshResult<QueueStatus> {
        lock(&self.inner.state)
            .queues
            .get(queue_id)
            .map(|q| q.status)
            .ok_or_else(|| MeshError::not_found(format!("queue {queue_id}")))
    }

    pub fn get_queue_stats(&self, queue_id: &str) -> MeshResult<QueueStats> {
        let state = lock(&self.inner.state);
        let queue = state
            .queues
            .get(queue_id)
            .ok_or_else(|| MeshError::not_found(format!("queue {queue_id}")))?;
        Ok(state.queue_stats(queue))
    }

    pub fn start_queue(&self, queue_id: &str) -> MeshResult<()> {
        self.inner.set_queue_status(queue_id, QueueStatus::Active)?;
        self.inner.pump(queue_id);
        Ok(())
    }

    /// Stop dispatching; running commands finish and new commands are still accepted
    pub fn pause_queue(&self, queue_id: &str) -> MeshResult<()> {
        self.inner.set_queue_status(queue_id, QueueStatus::Paused)
    }

    /// Stop dispatching and refuse new commands until the queue is started again
    pub fn stop_queue(&self, queue_id: &str) -> MeshResult<()> {
        self.inner.set_queue_status(queue_id, QueueStatus::Stopped)
    }

    /// Cancel every cancellable pending command. Returns how many were cancelled.
    pub fn clear_queue(&self, queue_id: &str) -> MeshResult<usize> {
        let cancelled = {
            let mut state = lock(&self.inner.state);
            if !state.queues.contains_key(queue_id) {
                return Err(MeshError::not_found(format!("queue {queue_id}")));
            }
            state.cancel_pending(queue_id, "queue cleared", false)
        };

        let count = cancelled.len();
        for command in cancelled {
            metrics().command_cancelled();
            self.inner
                .observers
                .notify(&CommandEvent::CommandCancelled(command));
        }
        info!(queue_id, cancelled = count, "command queue cleared");
        Ok(count)
    }

    /// Validate and queue a command; it goes to the user's default queue unless `queue_id` is given
    ///
    /// Must be called from within a Tokio runtime. Returns the command id.
    pub fn enqueue_command(
        &self,
        mut command: Command,
        queue_id: Option<&str>,
    ) -> MeshResult<String> {
        command.validate()?;

        let (queue_id, created, queued) = {
            let mut state = lock(&self.inner.state);
            if state.shut_down {
                return Err(MeshError::invalid_state("command service is shut down"));
            }
            if state
                .commands
                .get(&command.id)
                .is_some_and(|existing| !existing.status.is_terminal())
            {
                return Err(MeshError::validation(format!(
                    "command {} is already in flight",
                    command.id
                )));
            }

            let mut created = None;
            let queue_id = match queue_id {
                Some(id) => {
                    let queue = state
                        .queues
                        .get(id)
                        .ok_or_else(|| MeshError::not_found(format!("queue {id}")))?;
                    if queue.user_id != command.user_id {
                        return Err(MeshError::validation(format!(
                            "queue {id} does not belong to user {}",
                            command.user_id
                        )));
                    }
                    id.to_string()
                }
                None => match state.default_queues.get(&command.user_id) {
                    Some(id) => id.clone(),
                    None => {
                        let config = self.inner.config.default_queue.clone();
                        let id = state.insert_queue(&command.user_id, DEFAULT_QUEUE_NAME, config);
                        state
                            .default_queues
                            .insert(command.user_id.clone(), id.clone());
                        created = state.queue_info(&id);
                        id
                    }
                },
            };

            let queue = state
                .queues
                .get_mut(&queue_id)
                .ok_or_else(|| MeshError::not_found(format!("queue {queue_id}")))?;
            if queue.status == QueueStatus::Stopped {
                return Err(MeshError::invalid_state(format!("queue {queue_id} is stopped")));
            }
            if queue.pending.len() >= queue.config.max_size {
                return Err(MeshError::overflow(queue.pending.len(), queue.config.max_size));
            }

            command.status = CommandStatus::Pending;
            command.result = None;
            command.error = None;
            command.advance(CommandStatus::Queued);
            queue.pending.push(command.id.clone(), command.priority);

            state
                .command_queues
                .insert(command.id.clone(), queue_id.clone());
            state.commands.insert(command.id.clone(), command.clone());
            (queue_id, created, command)
        };

        if let Some(info) = created {
            self.inner
                .observers
                .notify(&CommandEvent::QueueCreated(info));
        }
        metrics().command_queued();
        debug!(
            command_id = %queued.id,
            queue_id = %queue_id,
            priority = ?queued.priority,
            "command queued"
        );
        let command_id = queued.id.clone();
        self.inner
            .observers
            .notify(&CommandEvent::CommandQueued(queued));

        self.inner.pump(&queue_id);
        Ok(command_id)
    }

    /// Cancel a command that has not finished yet
    ///
    /// Fails with `NotFound` for unknown ids and `InvalidState` for terminal or non-cancellable
    /// commands; the command is left untouched in both cases.
    pub fn cancel_command(&self, command_id: &str) -> MeshResult<Command> {
        let (cancelled, queue_id) = {
            let mut state = lock(&self.inner.state);
            let ServiceState {
                queues,
                commands,
                command_queues,
                running,
                ..
            } = &mut *state;

            let command = commands
                .get_mut(command_id)
                .ok_or_else(|| MeshError::not_found(format!("command {command_id}")))?;
            if command.status.is_terminal() {
                return Err(MeshError::invalid_state(format!(
                    "command {command_id} is already {}",
                    command.status.as_str()
                )));
            }
            if !command.config.cancellable {
                return Err(MeshError::invalid_state(format!(
                    "command {command_id} is not cancellable"
                )));
            }

            let queue_id = command_queues.get(command_id).cloned();
            if let Some(queue) = queue_id.as_ref().and_then(|id| queues.get_mut(id)) {
                queue.pending.remove(command_id);
                queue.executing.remove(command_id);
            }
            if let Some(handle) = running.remove(command_id) {
                handle.abort();
            }

            command.error = Some(CommandError::new(
                FailureCause::Cancelled,
                "cancelled by request",
            ));
            command.advance(CommandStatus::Cancelled);
            (command.clone(), queue_id)
        };

        metrics().command_cancelled();
        info!(command_id, "command cancelled");
        self.inner
            .observers
            .notify(&CommandEvent::CommandCancelled(cancelled.clone()));
        if let Some(queue_id) = queue_id {
            self.inner.pump(&queue_id);
        }
        Ok(cancelled)
    }

    pub fn get_command(&self, command_id: &str) -> Option<Command> {
        lock(&self.inner.state).commands.get(command_id).cloned()
    }

    /// Every known command of a user, oldest first
    pub fn list_commands(&self, user_id: &str) -> Vec<Command> {
        let state = lock(&self.inner.state);
        let mut commands: Vec<Command> = state
            .commands
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.timestamps.created_at);
        commands
    }

    pub fn get_metrics(&self) -> CommandPerformanceMetrics {
        self.inner.performance_metrics()
    }

    /// Run one cleanup pass now. Returns the number of commands deleted.
    pub fn run_cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Stop schedules, cancel pending and executing commands and drop all state
    pub fn shutdown(&self) {
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }

        let cancelled: Vec<Command> = {
            let mut state = lock(&self.inner.state);
            state.shut_down = true;
            for (_, handle) in state.running.drain() {
                handle.abort();
            }

            let mut cancelled = Vec::new();
            for command in state.commands.values_mut() {
                if command.status.is_terminal() {
                    continue;
                }
                command.error = Some(CommandError::new(
                    FailureCause::Shutdown,
                    "command service shut down",
                ));
                if command.advance(CommandStatus::Cancelled) {
                    cancelled.push(command.clone());
                }
            }

            state.queues.clear();
            state.default_queues.clear();
            state.commands.clear();
            state.command_queues.clear();
            cancelled
        };

        info!(cancelled = cancelled.len(), "command queue service shut down");
        for command in cancelled {
            metrics().command_cancelled();
            self.inner
                .observers
                .notify(&CommandEvent::CommandCancelled(command));
        }
    }
}

impl Drop for CommandQueueService {
    fn drop(&mut self) {
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }
        for (_, handle) in lock(&self.inner.state).running.drain() {
            handle.abort();
        }
    }
}
