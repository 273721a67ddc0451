//! Command queue service behaviour
//!
//! Exercises dispatch order, concurrency limits, the command lifecycle, cancellation, queue
//! control and cleanup through the public service API with scripted routing and execution.

use devicemesh::commands::{
    AutoCleanupConfig, Command, CommandConfig, CommandEvent, CommandPriority, CommandQueueConfig,
    CommandQueueService, CommandServiceConfig, CommandStatus, CommandType, ExecutionMode,
    FailureCause, QueueStatus, RelayExecutor, RoutingStrategy, TargetRouter,
};
use devicemesh::error::MeshError;
use devicemesh::protocol::{AckStatus, MessageType};
use devicemesh::testing::{test_device, RecordingSender, ScriptedExecutor, ScriptedRouter};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn command(priority: CommandPriority) -> Command {
    Command::new(
        CommandType::DeviceSync,
        "alice",
        "laptop",
        vec!["phone".to_string()],
        json!({}),
    )
    .with_priority(priority)
}

fn queue_config(max_concurrency: usize) -> CommandQueueConfig {
    CommandQueueConfig {
        max_concurrency,
        ..Default::default()
    }
}

fn service_with(
    router: ScriptedRouter,
    executor: Arc<ScriptedExecutor>,
) -> CommandQueueService {
    CommandQueueService::new(CommandServiceConfig::default(), Arc::new(router), executor)
}

fn record_events(service: &CommandQueueService) -> Arc<Mutex<Vec<CommandEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    service
        .observers()
        .subscribe(move |event: &CommandEvent| seen.lock().unwrap().push(event.clone()));
    events
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn status_of(service: &CommandQueueService, command_id: &str) -> Option<CommandStatus> {
    service.get_command(command_id).map(|c| c.status)
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_commands_run_first() {
    let executor = Arc::new(ScriptedExecutor::new());
    let service = service_with(ScriptedRouter::new(), Arc::clone(&executor));
    let queue = service
        .create_queue("alice", "ordered", Some(queue_config(1)))
        .unwrap();
    service.pause_queue(&queue.id).unwrap();

    let low = service
        .enqueue_command(command(CommandPriority::Low), Some(&queue.id))
        .unwrap();
    let critical = service
        .enqueue_command(command(CommandPriority::Critical), Some(&queue.id))
        .unwrap();
    let medium = service
        .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
        .unwrap();
    let emergency = service
        .enqueue_command(command(CommandPriority::Emergency), Some(&queue.id))
        .unwrap();
    assert!(executor.executed().is_empty());

    service.start_queue(&queue.id).unwrap();
    wait_until(|| executor.executed().len() == 4).await;

    assert_eq!(executor.executed(), vec![emergency, critical, medium, low]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_is_respected() {
    let executor = Arc::new(ScriptedExecutor::gated());
    let service = service_with(ScriptedRouter::new(), Arc::clone(&executor));
    let queue = service
        .create_queue("alice", "limited", Some(queue_config(2)))
        .unwrap();

    let ids: Vec<String> = (0..5)
        .map(|_| {
            service
                .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
                .unwrap()
        })
        .collect();

    wait_until(|| executor.in_flight() == 2).await;
    sleep(Duration::from_millis(100)).await;
    let stats = service.get_queue_stats(&queue.id).unwrap();
    assert_eq!(stats.executing, 2);
    assert_eq!(stats.queued, 3);

    executor.release(5);
    wait_until(|| {
        ids.iter()
            .all(|id| status_of(&service, id) == Some(CommandStatus::Completed))
    })
    .await;

    assert_eq!(executor.max_in_flight(), 2);
    let stats = service.get_queue_stats(&queue.id).unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.total_processed, 5);
    assert_eq!(stats.success_rate, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_command_walks_the_full_lifecycle() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::new()));
    let events = record_events(&service);

    let id = service
        .enqueue_command(command(CommandPriority::High), None)
        .unwrap();
    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Completed)).await;

    let finished = service.get_command(&id).unwrap();
    assert_eq!(finished.result, Some(json!({"targets": ["phone"]})));
    assert!(finished.error.is_none());
    assert!(finished.timestamps.queued_at.is_some());
    assert!(finished.timestamps.execution_started_at.is_some());
    assert!(finished.processing_time_ms().is_some());

    let lifecycle: Vec<&'static str> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            CommandEvent::CommandQueued(c) if c.id == id => Some("queued"),
            CommandEvent::CommandRouting(c) if c.id == id => Some("routing"),
            CommandEvent::CommandExecuting(c) if c.id == id => Some("executing"),
            CommandEvent::CommandCompleted(c) if c.id == id => Some("completed"),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle, vec!["queued", "routing", "executing", "completed"]);
}

#[tokio::test(start_paused = true)]
async fn test_default_queue_is_created_per_user() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::new()));
    let events = record_events(&service);

    service
        .enqueue_command(command(CommandPriority::Medium), None)
        .unwrap();
    service
        .enqueue_command(command(CommandPriority::Medium), None)
        .unwrap();

    let queues = service.list_queues("alice");
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].name, "default");
    assert_eq!(queues[0].status, QueueStatus::Active);
    let created = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, CommandEvent::QueueCreated(_)))
        .count();
    assert_eq!(created, 1);
    assert!(service.list_queues("bob").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_routing_and_execution_failures() {
    let service = service_with(ScriptedRouter::failing(), Arc::new(ScriptedExecutor::new()));
    let id = service
        .enqueue_command(command(CommandPriority::Medium), None)
        .unwrap();
    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Failed)).await;
    let failed = service.get_command(&id).unwrap();
    assert_eq!(failed.error.unwrap().cause, FailureCause::Routing);

    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::new()));
    let mut failing = command(CommandPriority::Medium);
    failing.payload = json!({"fail": true});
    let failing_id = service.enqueue_command(failing, None).unwrap();
    let ok_id = service
        .enqueue_command(command(CommandPriority::Medium), None)
        .unwrap();
    wait_until(|| {
        status_of(&service, &failing_id) == Some(CommandStatus::Failed)
            && status_of(&service, &ok_id) == Some(CommandStatus::Completed)
    })
    .await;

    let failed = service.get_command(&failing_id).unwrap();
    assert_eq!(failed.error.unwrap().cause, FailureCause::Execution);
    let metrics = service.get_metrics();
    assert_eq!(metrics.total_commands, 2);
    assert_eq!(metrics.success_rate, 0.5);
    assert_eq!(metrics.commands_by_status.get("failed"), Some(&1));
    assert_eq!(metrics.commands_by_type.get("device_sync"), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_slow_execution_times_out() {
    let service = service_with(
        ScriptedRouter::new(),
        Arc::new(ScriptedExecutor::with_delay(Duration::from_secs(10))),
    );
    let id = service
        .enqueue_command(command(CommandPriority::Medium).with_timeout(1000), None)
        .unwrap();

    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Failed)).await;
    let failed = service.get_command(&id).unwrap();
    assert_eq!(failed.error.unwrap().cause, FailureCause::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_caps_command_timeout() {
    let service = service_with(
        ScriptedRouter::with_delay(Duration::from_secs(10)),
        Arc::new(ScriptedExecutor::new()),
    );
    let queue = service
        .create_queue(
            "alice",
            "strict",
            Some(CommandQueueConfig {
                timeout_ms: 500,
                ..Default::default()
            }),
        )
        .unwrap();
    let id = service
        .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
        .unwrap();

    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Failed)).await;
    let error = service.get_command(&id).unwrap().error.unwrap();
    assert_eq!(error.cause, FailureCause::Timeout);
    assert!(error.message.contains("routing"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_semantics() {
    let executor = Arc::new(ScriptedExecutor::gated());
    let service = service_with(ScriptedRouter::new(), Arc::clone(&executor));
    let queue = service
        .create_queue("alice", "serial", Some(queue_config(1)))
        .unwrap();

    let running = service
        .enqueue_command(command(CommandPriority::High), Some(&queue.id))
        .unwrap();
    let waiting = service
        .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
        .unwrap();
    let pinned = service
        .enqueue_command(
            command(CommandPriority::Low).non_cancellable(),
            Some(&queue.id),
        )
        .unwrap();
    wait_until(|| status_of(&service, &running) == Some(CommandStatus::Executing)).await;

    let cancelled = service.cancel_command(&waiting).unwrap();
    assert_eq!(cancelled.status, CommandStatus::Cancelled);
    assert_eq!(cancelled.error.unwrap().cause, FailureCause::Cancelled);

    // Cancelling a terminal command leaves it untouched
    assert!(matches!(
        service.cancel_command(&waiting),
        Err(MeshError::InvalidState { .. })
    ));
    assert!(matches!(
        service.cancel_command(&pinned),
        Err(MeshError::InvalidState { .. })
    ));
    assert_eq!(status_of(&service, &pinned), Some(CommandStatus::Queued));
    assert!(matches!(
        service.cancel_command("cmd_missing"),
        Err(MeshError::NotFound { .. })
    ));

    // Cancelling the running command frees its slot for the next one
    service.cancel_command(&running).unwrap();
    wait_until(|| status_of(&service, &pinned) == Some(CommandStatus::Executing)).await;
    assert_eq!(status_of(&service, &running), Some(CommandStatus::Cancelled));

    executor.release(1);
    wait_until(|| status_of(&service, &pinned) == Some(CommandStatus::Completed)).await;
    // The aborted execution never reports back
    assert_eq!(status_of(&service, &running), Some(CommandStatus::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_pause_stop_and_start() {
    let executor = Arc::new(ScriptedExecutor::new());
    let service = service_with(ScriptedRouter::new(), Arc::clone(&executor));
    let queue = service.create_queue("alice", "controlled", None).unwrap();

    service.pause_queue(&queue.id).unwrap();
    assert_eq!(service.get_queue_status(&queue.id).unwrap(), QueueStatus::Paused);
    let id = service
        .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(&service, &id), Some(CommandStatus::Queued));

    service.stop_queue(&queue.id).unwrap();
    assert!(matches!(
        service.enqueue_command(command(CommandPriority::Medium), Some(&queue.id)),
        Err(MeshError::InvalidState { .. })
    ));

    service.start_queue(&queue.id).unwrap();
    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Completed)).await;

    assert!(matches!(
        service.start_queue("queue_missing"),
        Err(MeshError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_clear_queue_keeps_non_cancellable_commands() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::new()));
    let queue = service.create_queue("alice", "clearable", None).unwrap();
    service.pause_queue(&queue.id).unwrap();

    let first = service
        .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
        .unwrap();
    service
        .enqueue_command(command(CommandPriority::High), Some(&queue.id))
        .unwrap();
    let pinned = service
        .enqueue_command(
            command(CommandPriority::Low).non_cancellable(),
            Some(&queue.id),
        )
        .unwrap();

    assert_eq!(service.clear_queue(&queue.id).unwrap(), 2);
    assert_eq!(status_of(&service, &first), Some(CommandStatus::Cancelled));
    assert_eq!(status_of(&service, &pinned), Some(CommandStatus::Queued));
    let stats = service.get_queue_stats(&queue.id).unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.cancelled, 2);
}

#[tokio::test(start_paused = true)]
async fn test_delete_queue_cancels_everything_pending() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::new()));
    let events = record_events(&service);
    let queue = service.create_queue("alice", "doomed", None).unwrap();
    service.pause_queue(&queue.id).unwrap();
    let pinned = service
        .enqueue_command(
            command(CommandPriority::Low).non_cancellable(),
            Some(&queue.id),
        )
        .unwrap();

    service.delete_queue(&queue.id).unwrap();

    assert!(service.get_queue(&queue.id).is_none());
    assert_eq!(status_of(&service, &pinned), Some(CommandStatus::Cancelled));
    assert!(events.lock().unwrap().contains(&CommandEvent::QueueDeleted {
        queue_id: queue.id.clone()
    }));
    assert!(matches!(
        service.delete_queue(&queue.id),
        Err(MeshError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_validation() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::gated()));

    let mut untargeted = command(CommandPriority::Medium);
    untargeted.target_device_ids.clear();
    assert!(matches!(
        service.enqueue_command(untargeted, None),
        Err(MeshError::Validation { .. })
    ));

    let bobs = service.create_queue("bob", "private", None).unwrap();
    assert!(matches!(
        service.enqueue_command(command(CommandPriority::Medium), Some(&bobs.id)),
        Err(MeshError::Validation { .. })
    ));
    assert!(matches!(
        service.enqueue_command(command(CommandPriority::Medium), Some("queue_missing")),
        Err(MeshError::NotFound { .. })
    ));

    let in_flight = command(CommandPriority::Medium);
    service.enqueue_command(in_flight.clone(), None).unwrap();
    assert!(matches!(
        service.enqueue_command(in_flight, None),
        Err(MeshError::Validation { .. })
    ));

    let tiny = service
        .create_queue(
            "alice",
            "tiny",
            Some(CommandQueueConfig {
                max_size: 1,
                ..Default::default()
            }),
        )
        .unwrap();
    service.pause_queue(&tiny.id).unwrap();
    service
        .enqueue_command(command(CommandPriority::Medium), Some(&tiny.id))
        .unwrap();
    assert!(matches!(
        service.enqueue_command(command(CommandPriority::Medium), Some(&tiny.id)),
        Err(MeshError::Overflow { size: 1, max: 1 })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_caps_retained_commands() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::new()));
    let queue = service
        .create_queue(
            "alice",
            "bounded",
            Some(CommandQueueConfig {
                max_concurrency: 1,
                auto_cleanup: AutoCleanupConfig {
                    max_completed_commands: 1,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
        .unwrap();

    let ids: Vec<String> = (0..3)
        .map(|_| {
            service
                .enqueue_command(command(CommandPriority::Medium), Some(&queue.id))
                .unwrap()
        })
        .collect();
    wait_until(|| {
        ids.iter()
            .all(|id| status_of(&service, id) == Some(CommandStatus::Completed))
    })
    .await;

    assert_eq!(service.run_cleanup(), 2);
    assert_eq!(service.list_commands("alice").len(), 1);
    assert_eq!(service.run_cleanup(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_metrics_are_published() {
    let service = CommandQueueService::new(
        CommandServiceConfig {
            metrics_interval_ms: 1000,
            ..Default::default()
        },
        Arc::new(ScriptedRouter::new()),
        Arc::new(ScriptedExecutor::new()),
    );
    let events = record_events(&service);
    service.start();
    service.start();

    sleep(Duration::from_millis(1500)).await;

    let published = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, CommandEvent::PerformanceMetrics(_)))
        .count();
    assert_eq!(published, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_and_refuses_work() {
    let service = service_with(ScriptedRouter::new(), Arc::new(ScriptedExecutor::gated()));
    let events = record_events(&service);
    let id = service
        .enqueue_command(command(CommandPriority::Medium), None)
        .unwrap();
    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Executing)).await;

    service.shutdown();

    let cancelled: Vec<Command> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            CommandEvent::CommandCancelled(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].error.as_ref().unwrap().cause, FailureCause::Shutdown);
    assert!(service.get_command(&id).is_none());
    assert!(matches!(
        service.enqueue_command(command(CommandPriority::Medium), None),
        Err(MeshError::InvalidState { .. })
    ));
    assert!(matches!(
        service.create_queue("alice", "late", None),
        Err(MeshError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_relay_execution_sends_command_messages() {
    let sender = Arc::new(RecordingSender::new(test_device("laptop")));
    let service = CommandQueueService::new(
        CommandServiceConfig::default(),
        Arc::new(TargetRouter::new()),
        Arc::new(RelayExecutor::new(sender.clone())),
    );

    let broadcast = Command::new(
        CommandType::MessageBroadcast,
        "alice",
        "laptop",
        vec!["phone".to_string(), "tablet".to_string(), "phone".to_string()],
        json!({"text": "hello"}),
    )
    .with_config(CommandConfig {
        routing_strategy: RoutingStrategy::Broadcast,
        execution_mode: ExecutionMode::Synchronous,
        ..Default::default()
    });
    let id = service.enqueue_command(broadcast, None).unwrap();
    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Completed)).await;

    let sent = sender.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.message_type == MessageType::Command));
    assert!(sent.iter().all(|m| m.requires_ack()));
    let targets: Vec<Option<String>> = sent
        .iter()
        .map(|m| m.destination.device_id.clone())
        .collect();
    assert_eq!(
        targets,
        vec![Some("phone".to_string()), Some("tablet".to_string())]
    );
    let result = service.get_command(&id).unwrap().result.unwrap();
    assert_eq!(result["deliveredTo"], json!(["phone", "tablet"]));
}

#[tokio::test(start_paused = true)]
async fn test_relay_execution_fails_when_every_target_rejects() {
    let sender = Arc::new(
        RecordingSender::new(test_device("laptop")).with_ack_status(AckStatus::Failed),
    );
    let service = CommandQueueService::new(
        CommandServiceConfig::default(),
        Arc::new(TargetRouter::new()),
        Arc::new(RelayExecutor::new(sender)),
    );

    let id = service
        .enqueue_command(
            command(CommandPriority::Medium).with_config(CommandConfig {
                execution_mode: ExecutionMode::Synchronous,
                ..Default::default()
            }),
            None,
        )
        .unwrap();
    wait_until(|| status_of(&service, &id) == Some(CommandStatus::Failed)).await;
    let error = service.get_command(&id).unwrap().error.unwrap();
    assert_eq!(error.cause, FailureCause::Execution);
}
