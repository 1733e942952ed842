//! Self-healing of failed pipeline executions.
//!
//! These tests run a batch pipeline into a structural failure and follow
//! the error through the error-resolution agent, the coordination cycle and
//! the self-healer. Remediation re-runs the failed execution through the
//! controller until it loads or an operator is paged.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use pipewright::agent::{Agent, AgentId, AgentType};
use pipewright::channel::{topics, PlatformEvent};
use pipewright::config::{Config, ErrorHandlingPolicy, PipelineOverrides};
use pipewright::core::{
    Confidence, Pipeline, PipelineConfig, PipelineId, PipelineStatus, PipelineType, TaskType,
};
use pipewright::healing::{HealingAgent, HealingState, Resolution, Strategy};
use pipewright::orchestration::RunOutcome;
use pipewright::pipeline::io::{MemoryDestination, MemorySource};
use pipewright::pipeline::{BatchEngine, Record};
use pipewright::store::MetadataStore;
use pipewright::Error;

use crate::fixtures::Platform;

struct Batch {
    source: Arc<MemorySource>,
    destination: Arc<MemoryDestination>,
    engine: Arc<BatchEngine>,
}

fn row(id: usize) -> Record {
    Record::from([("id".to_string(), json!(id))])
}

/// An engine for "orders", attached to the controller for remediation.
async fn batch(platform: &Platform, rows: usize) -> Batch {
    let source = Arc::new(MemorySource::new((0..rows).map(row).collect()));
    let destination = Arc::new(MemoryDestination::new());
    let engine = Arc::new(
        BatchEngine::new(source.clone(), destination.clone(), platform.channel.clone())
            .with_transport_retries(1, Duration::from_millis(1)),
    );
    platform
        .controller
        .attach_batch(&"orders".into(), engine.clone())
        .await
        .unwrap();
    Batch {
        source,
        destination,
        engine,
    }
}

fn with_max_attempts(max_attempts: u32) -> Config {
    let mut config = Config::default();
    config.pipelines.insert(
        "orders".into(),
        PipelineOverrides {
            error_handling: Some(ErrorHandlingPolicy {
                max_attempts,
                base_backoff_ms: 100,
                max_backoff_ms: 1_000,
                ..ErrorHandlingPolicy::default()
            }),
        },
    );
    config
}

fn resolution_event(events: &[PlatformEvent]) -> Option<Resolution> {
    events.iter().find_map(|e| match e {
        PlatformEvent::ErrorResolved { resolution } | PlatformEvent::ErrorEscalated { resolution } => {
            Some(resolution.clone())
        }
        _ => None,
    })
}

async fn platform_with_healer(config: Config) -> Platform {
    let platform = Platform::new(config);
    let id = AgentId::from("healer-1");
    let agent = Agent::new(id.clone(), AgentType::ErrorResolution, Confidence::clamped(0.8));
    let handler = Arc::new(HealingAgent::new(id, platform.healer.clone()));
    platform.add_agent(agent, handler).await;
    platform
        .controller
        .register(Pipeline::new("orders", PipelineType::Batch, PipelineConfig::default()))
        .await
        .lock()
        .await
        .schedule()
        .unwrap();
    platform
}

/// Feed the latest `PipelineFailed` to the orchestrator and run the
/// error-resolution agent and one coordination cycle.
async fn coordinate_failure(platform: &Platform) {
    let failure = platform
        .channel
        .published(topics::PIPELINE_ERRORS)
        .await
        .pop()
        .expect("PipelineFailed");
    platform.orchestrator.ingest(&failure).await.unwrap().unwrap();
    let assignment = platform
        .orchestrator
        .dispatch_next(TaskType::ErrorResolution)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        platform.orchestrator.run_task(&assignment).await.unwrap(),
        RunOutcome::Decided(_)
    ));
    let report = platform.orchestrator.run_coordination_cycle().await.unwrap();
    assert_eq!(report.applied.len(), 1);
}

/// Test: A connection failure is retried and the execution completes
/// Given a batch run that loses its source connection
/// When the error-resolution decision is applied
/// Then the retry re-runs the execution, loads every record and completes the pipeline
#[tokio::test(start_paused = true)]
async fn test_failed_batch_is_retried_and_completed() {
    let platform = platform_with_healer(Config::default()).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 3).await;
    run.source
        .fail_next(Error::StructuralFailure("connection refused".into()));

    let failed = platform.controller.run_batch(&orders, &run.engine).await;
    assert!(matches!(failed, Err(Error::StructuralFailure(_))));
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Failed);

    coordinate_failure(&platform).await;
    platform.deliver().await;

    let resolved = platform.events(topics::PIPELINE_EVENTS).await;
    let resolution = resolved
        .iter()
        .find_map(|e| match e {
            PlatformEvent::ErrorResolved { resolution } => Some(resolution.clone()),
            _ => None,
        })
        .expect("ErrorResolved");
    assert_eq!(resolution.strategy, Strategy::Retry);
    assert_eq!(resolution.attempts, 1);
    assert_eq!(
        platform.healer.state(&resolution.error_id).await,
        Some(HealingState::Resolved)
    );
    assert_eq!(platform.store.load_attempts(&resolution.error_id).unwrap(), Some(1));
    assert_eq!(platform.store.load_resolutions().unwrap().len(), 1);
    assert_eq!(run.destination.loaded().len(), 3);
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Completed);
    assert!(platform
        .events(topics::PIPELINE_EVENTS)
        .await
        .iter()
        .any(|e| matches!(e, PlatformEvent::ExecutionCompleted { metrics, .. } if metrics.row_count == 3)));

    let refused = platform.controller.run_batch(&orders, &run.engine).await;
    assert!(matches!(refused, Err(Error::InvalidTransition { .. })));
    assert_eq!(run.destination.loaded().len(), 3);
}

/// Test: A failed pipeline cannot be run again without a resolution
/// Given a batch run that failed and has not been healed
/// When the pipeline is run again directly
/// Then the run is refused, nothing is loaded and the pipeline stays failed
#[tokio::test(start_paused = true)]
async fn test_failed_batch_is_not_rerun_without_resolution() {
    let platform = platform_with_healer(Config::default()).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 2).await;
    run.source
        .fail_next(Error::StructuralFailure("connection refused".into()));
    assert!(platform.controller.run_batch(&orders, &run.engine).await.is_err());

    let again = platform.controller.run_batch(&orders, &run.engine).await;

    assert!(matches!(again, Err(Error::InvalidTransition { .. })));
    assert!(run.destination.loaded().is_empty());
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Failed);
    assert_eq!(platform.channel.published(topics::PIPELINE_ERRORS).await.len(), 1);
}

/// Test: A retry that succeeds on its second attempt
/// Given a source that is still down for the first retry
/// When the error-resolution decision is applied
/// Then the second attempt loads everything and the resolution counts two attempts
#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_on_second_attempt() {
    let platform = platform_with_healer(Config::default()).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 3).await;
    run.source
        .fail_next(Error::StructuralFailure("connection refused".into()));
    run.source
        .fail_next(Error::StructuralFailure("connection refused".into()));
    assert!(platform.controller.run_batch(&orders, &run.engine).await.is_err());

    coordinate_failure(&platform).await;
    platform.deliver().await;

    let resolution = resolution_event(&platform.events(topics::PIPELINE_EVENTS).await)
        .expect("resolution");
    assert!(resolution.success);
    assert_eq!(resolution.attempts, 2);
    assert_eq!(run.destination.loaded().len(), 3);
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Completed);
}

/// Test: A retry that keeps failing escalates
/// Given a source that stays down for every retry the policy allows
/// When the error-resolution decision is applied
/// Then the error escalates, nothing is loaded and the pipeline stays failed
#[tokio::test(start_paused = true)]
async fn test_failing_retries_escalate() {
    let platform = platform_with_healer(with_max_attempts(2)).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 3).await;
    for _ in 0..3 {
        run.source
            .fail_next(Error::StructuralFailure("connection refused".into()));
    }
    assert!(platform.controller.run_batch(&orders, &run.engine).await.is_err());

    coordinate_failure(&platform).await;
    platform.deliver().await;

    let resolution = resolution_event(&platform.events(topics::PIPELINE_EVENTS).await)
        .expect("resolution");
    assert!(resolution.is_escalated());
    assert_eq!(resolution.attempts, 2);
    assert_eq!(resolution.context["escalation_reason"], json!("max attempts (2) reached"));
    assert_eq!(
        platform.healer.state(&resolution.error_id).await,
        Some(HealingState::Escalated)
    );
    assert!(run.destination.loaded().is_empty());
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Failed);
}

/// Test: Skipping a rejected record
/// Given a load that the destination refuses because of one record
/// When the error is resolved by skipping
/// Then the re-run loads every other record and later runs keep excluding it
#[tokio::test(start_paused = true)]
async fn test_skip_drops_rejected_record() {
    let platform = platform_with_healer(Config::default()).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 3).await;
    run.destination.reject(row(1));
    let failed = platform.controller.run_batch(&orders, &run.engine).await;
    assert!(matches!(failed, Err(Error::RecordRejected { .. })));
    let error = match platform.events(topics::PIPELINE_ERRORS).await.pop() {
        Some(PlatformEvent::PipelineFailed { error }) => error,
        other => panic!("expected PipelineFailed, got {other:?}"),
    };

    let id = platform.healer.capture(error).await.unwrap();
    let resolution = platform
        .healer
        .resolve_with(&id, Strategy::Skip, None)
        .await
        .unwrap();
    platform.deliver().await;

    assert_eq!(resolution.strategy, Strategy::Skip);
    assert!(resolution.success);
    assert_eq!(run.destination.loaded(), vec![row(0), row(2)]);
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Completed);
    let machine = platform.controller.machine(&orders).await.unwrap();
    assert_eq!(machine.lock().await.skipped_records(), &[row(1)]);
}

/// Test: Remediation on a stopped pipeline escalates
/// Given a failed pipeline that an operator stops before it is healed
/// When every retry is refused
/// Then the error escalates after the policy's attempts with its context
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_escalate() {
    let platform = platform_with_healer(with_max_attempts(2)).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 1).await;
    run.source
        .fail_next(Error::StructuralFailure("connection refused".into()));
    let _ = platform.controller.run_batch(&orders, &run.engine).await;
    platform
        .controller
        .stop_pipeline(&orders, "maintenance")
        .await
        .unwrap();

    coordinate_failure(&platform).await;
    platform.deliver().await;

    let events = platform.events(topics::PIPELINE_EVENTS).await;
    let resolution = events
        .iter()
        .find_map(|e| match e {
            PlatformEvent::ErrorEscalated { resolution } => Some(resolution.clone()),
            _ => None,
        })
        .expect("ErrorEscalated");
    assert!(!resolution.success);
    assert_eq!(resolution.attempts, 2);
    assert_eq!(resolution.context["escalation_reason"], json!("max attempts (2) reached"));
    assert_eq!(platform.controller.status(&orders).await.unwrap(), PipelineStatus::Stopped);

    let again = platform
        .healer
        .resolve_with(&resolution.error_id, Strategy::Retry, None)
        .await;
    assert!(matches!(again, Err(Error::AlreadyEscalated(_))));
}

/// Test: A redelivered failure is healed once
/// Given the whole event history delivered twice
/// When the consumers see the same events again
/// Then there is still exactly one resolution and one recovery
#[tokio::test(start_paused = true)]
async fn test_redelivery_does_not_heal_twice() {
    let platform = platform_with_healer(Config::default()).await;
    let orders: PipelineId = "orders".into();
    let run = batch(&platform, 2).await;
    run.source
        .fail_next(Error::StructuralFailure("connection refused".into()));
    let _ = platform.controller.run_batch(&orders, &run.engine).await;

    coordinate_failure(&platform).await;
    platform.deliver().await;
    platform.deliver().await;

    let resolved = platform
        .events(topics::PIPELINE_EVENTS)
        .await
        .into_iter()
        .filter(|e| matches!(e, PlatformEvent::ErrorResolved { .. }))
        .count();
    assert_eq!(resolved, 1);
    assert_eq!(platform.store.load_resolutions().unwrap().len(), 1);
    let machine = platform.controller.machine(&orders).await.unwrap();
    let recoveries = machine
        .lock()
        .await
        .history()
        .iter()
        .filter(|t| t.from == PipelineStatus::Failed)
        .count();
    assert_eq!(recoveries, 1);
    assert_eq!(run.destination.loaded().len(), 2);
    assert_eq!(machine.lock().await.status(), PipelineStatus::Completed);
}
