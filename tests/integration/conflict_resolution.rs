//! Arbitration between agents acting on the same pipeline.
//!
//! These tests verify that contradictory decisions inside one coordination
//! window are settled deterministically and that only the winner has any
//! effect.

use pipewright::agent::AgentType;
use pipewright::channel::{topics, Event, PipelineCommand, PlatformEvent};
use pipewright::config::Config;
use pipewright::core::{
    DecisionAction, DecisionOutcome, ExecutionId, PipelineType, TaskId, TaskType,
};
use pipewright::healing::PipelineError;
use pipewright::orchestration::{CycleReport, ResolutionRule};
use pipewright::store::MetadataStore;

use crate::fixtures::{schema_changed, FixedAgent, Platform};

fn pipeline_failed(pipeline: &str) -> Event {
    Event::new(
        topics::PIPELINE_ERRORS,
        "engine",
        PlatformEvent::PipelineFailed {
            error: PipelineError::new(
                pipeline.into(),
                PipelineType::Batch,
                ExecutionId::new(),
                "connection reset by peer",
            ),
        },
    )
}

/// An error-resolution agent and a mapping agent, each with one fixed answer.
async fn platform_with(healer: (DecisionAction, f64), mapper: (DecisionAction, f64), threshold: f64) -> Platform {
    let platform = Platform::new(Config::default());
    let (agent, handler) =
        FixedAgent::pair("resolver-1", AgentType::ErrorResolution, healer.0, healer.1, threshold);
    platform.add_agent(agent, handler).await;
    let (agent, handler) =
        FixedAgent::pair("mapper-1", AgentType::SchemaMapping, mapper.0, mapper.1, threshold);
    platform.add_agent(agent, handler).await;
    platform
}

/// Ingest both events, run both agents, then run one cycle.
async fn decide(platform: &Platform, events: [Event; 2]) -> (Vec<TaskId>, CycleReport) {
    let mut tasks = Vec::new();
    for event in &events {
        tasks.push(platform.orchestrator.ingest(event).await.unwrap().unwrap());
    }
    for task_type in [TaskType::ErrorResolution, TaskType::Mapping] {
        let assignment = platform
            .orchestrator
            .dispatch_next(task_type)
            .await
            .unwrap()
            .unwrap();
        platform.orchestrator.run_task(&assignment).await.unwrap();
    }
    assert_eq!(platform.orchestrator.pending_decisions().await, 2);
    let report = platform.orchestrator.run_coordination_cycle().await.unwrap();
    (tasks, report)
}

fn last_outcome(platform: &Platform, task_id: &TaskId) -> Option<DecisionOutcome> {
    platform
        .store
        .decisions_for_task(task_id)
        .unwrap()
        .last()
        .and_then(|d| d.outcome)
}

/// Test: Equal confidence falls back to agent priority
/// Given a retry and a pause proposed for one pipeline with equal confidence
/// When the cycle arbitrates
/// Then the error-resolution agent wins and no pause is issued
#[tokio::test]
async fn test_equal_confidence_prefers_error_resolution() {
    let platform = platform_with(
        (DecisionAction::Retry, 0.9),
        (DecisionAction::PausePipeline, 0.9),
        0.8,
    )
    .await;

    let (tasks, report) = decide(
        &platform,
        [pipeline_failed("orders"), schema_changed("orders", 3)],
    )
    .await;

    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.superseded.len(), 1);
    let resolution = &report.superseded[0];
    assert_eq!(resolution.rule, ResolutionRule::AgentPriority);
    assert_eq!(resolution.winner.action, DecisionAction::Retry);

    assert_eq!(last_outcome(&platform, &tasks[0]), Some(DecisionOutcome::Applied));
    assert_eq!(last_outcome(&platform, &tasks[1]), Some(DecisionOutcome::Superseded));
    assert!(platform.events(topics::PIPELINE_CONTROL).await.is_empty());
    assert!(platform
        .events(topics::COORDINATION)
        .await
        .iter()
        .any(|e| matches!(e, PlatformEvent::ConflictResolved { rule: ResolutionRule::AgentPriority, .. })));
}

/// Test: Confidence outranks agent priority
/// Given a hesitant retry and a confident pause on one pipeline
/// When the cycle arbitrates
/// Then the pause wins and is sent to the pipeline
#[tokio::test]
async fn test_higher_confidence_wins() {
    let platform = platform_with(
        (DecisionAction::Retry, 0.6),
        (DecisionAction::PausePipeline, 0.97),
        0.5,
    )
    .await;

    let (tasks, report) = decide(
        &platform,
        [pipeline_failed("orders"), schema_changed("orders", 3)],
    )
    .await;

    assert_eq!(report.superseded[0].rule, ResolutionRule::Confidence);
    assert_eq!(last_outcome(&platform, &tasks[0]), Some(DecisionOutcome::Superseded));
    assert_eq!(last_outcome(&platform, &tasks[1]), Some(DecisionOutcome::Applied));
    assert!(matches!(
        platform.events(topics::PIPELINE_CONTROL).await.as_slice(),
        [PlatformEvent::PipelineControl {
            command: PipelineCommand::Pause,
            ..
        }]
    ));
}

/// Test: Decisions on different pipelines never conflict
/// Given a retry on one pipeline and a pause on another
/// When the cycle arbitrates
/// Then both are applied
#[tokio::test]
async fn test_distinct_pipelines_do_not_conflict() {
    let platform = platform_with(
        (DecisionAction::Retry, 0.9),
        (DecisionAction::PausePipeline, 0.9),
        0.8,
    )
    .await;

    let (_, report) = decide(
        &platform,
        [pipeline_failed("orders"), schema_changed("payments", 3)],
    )
    .await;

    assert_eq!(report.applied.len(), 2);
    assert!(report.superseded.is_empty());
}

/// Test: An untrusted winner is deferred, not applied
/// Given a conflict whose winner is below its agent's threshold
/// When the cycle arbitrates
/// Then the winner waits for review and the loser is still superseded
#[tokio::test]
async fn test_low_confidence_winner_is_deferred() {
    let platform = platform_with(
        (DecisionAction::Retry, 0.7),
        (DecisionAction::PausePipeline, 0.6),
        0.8,
    )
    .await;

    let (tasks, report) = decide(
        &platform,
        [pipeline_failed("orders"), schema_changed("orders", 3)],
    )
    .await;

    assert!(report.applied.is_empty());
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(report.superseded.len(), 1);
    assert_eq!(last_outcome(&platform, &tasks[0]), Some(DecisionOutcome::Deferred));
    assert!(platform
        .events(topics::COORDINATION)
        .await
        .iter()
        .any(|e| matches!(e, PlatformEvent::DecisionDeferred { .. })));
    assert!(platform.events(topics::PIPELINE_CONTROL).await.is_empty());
}
