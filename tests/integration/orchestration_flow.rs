//! Event ingestion through decision application.
//!
//! These tests verify that typed events become tasks, that agents' decisions
//! are recorded before they are announced, and that applied decisions reach
//! the pipeline they target.

use std::time::Duration;

use pipewright::agent::AgentType;
use pipewright::channel::{topics, EventChannel, PlatformEvent};
use pipewright::config::Config;
use pipewright::core::{
    DecisionAction, DecisionOutcome, Pipeline, PipelineConfig, PipelineStatus, PipelineType,
    TaskType,
};
use pipewright::orchestration::RunOutcome;
use pipewright::store::{CoordinationEntry, MetadataStore};

use crate::fixtures::{schedule_tick, schema_changed, FixedAgent, Platform};

fn fast_window() -> Config {
    let mut config = Config::default();
    config.orchestrator.coordination_window_ms = 100;
    config
}

/// Test: Schema change resumes a paused stream on the new mappings
/// Given a paused stream pipeline and a confident mapping agent
/// When a SchemaChanged event is ingested and the cycle runs
/// Then the pipeline runs again on schema version 2
#[tokio::test]
async fn test_schema_change_updates_mapping_and_resumes() {
    let platform = Platform::new(Config::default());
    let (agent, handler) = FixedAgent::pair(
        "mapper-1",
        AgentType::SchemaMapping,
        DecisionAction::UpdateMapping { schema_version: 2 },
        0.92,
        0.8,
    );
    platform.add_agent(agent, handler).await;
    let machine = platform
        .controller
        .register(Pipeline::new("clicks", PipelineType::Stream, PipelineConfig::default()))
        .await;
    {
        let mut m = machine.lock().await;
        m.start().unwrap();
        m.run().unwrap();
        m.pause().unwrap();
    }

    let task_id = platform
        .orchestrator
        .ingest(&schema_changed("clicks", 2))
        .await
        .unwrap()
        .expect("mapping task");
    let assignment = platform
        .orchestrator
        .dispatch_next(TaskType::Mapping)
        .await
        .unwrap()
        .expect("assignment");
    assert_eq!(assignment.task_id, task_id);
    assert!(matches!(
        platform.orchestrator.run_task(&assignment).await.unwrap(),
        RunOutcome::Decided(_)
    ));
    let report = platform.orchestrator.run_coordination_cycle().await.unwrap();
    assert_eq!(report.applied.len(), 1);

    platform.deliver().await;

    let m = machine.lock().await;
    assert_eq!(m.pipeline().schema_version, 2);
    assert_eq!(m.status(), PipelineStatus::Running);
    drop(m);

    let decisions = platform.store.decisions_for_task(&task_id).unwrap();
    assert_eq!(
        decisions.last().and_then(|d| d.outcome),
        Some(DecisionOutcome::Applied)
    );
    let agent = platform
        .orchestrator
        .registry()
        .get(&"mapper-1".into())
        .await
        .unwrap();
    assert_eq!(agent.current_load, 0);
}

/// Test: Every published event has a prior log entry
/// Given an applied mapping decision
/// When the coordination log is read back
/// Then each published event id appears in a Notified entry
#[tokio::test]
async fn test_published_events_are_logged_first() {
    let platform = Platform::new(Config::default());
    let (agent, handler) = FixedAgent::pair(
        "mapper-1",
        AgentType::SchemaMapping,
        DecisionAction::UpdateMapping { schema_version: 4 },
        0.95,
        0.8,
    );
    platform.add_agent(agent, handler).await;

    platform
        .orchestrator
        .ingest(&schema_changed("orders", 4))
        .await
        .unwrap();
    let assignment = platform
        .orchestrator
        .dispatch_next(TaskType::Mapping)
        .await
        .unwrap()
        .unwrap();
    platform.orchestrator.run_task(&assignment).await.unwrap();
    platform.orchestrator.run_coordination_cycle().await.unwrap();

    let log = platform.store.coordination_log().unwrap();
    let notified: Vec<_> = log
        .iter()
        .filter_map(|r| match &r.entry {
            CoordinationEntry::Notified { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .collect();
    let published = platform.channel.published_all().await;
    assert_eq!(published.len(), 4, "assigned, applied, mapping updated, resume");
    for event in &published {
        assert!(notified.contains(&event.id), "{} was not logged", event.body.event_type());
    }
    assert!(matches!(log[0].entry, CoordinationEntry::TaskAssigned { .. }));
}

/// Test: The orchestrator actor runs a discovery round by itself
/// Given a spawned orchestrator and a discovery agent
/// When the same ScheduleTick is published twice
/// Then one catalog update is announced
#[tokio::test(start_paused = true)]
async fn test_spawned_orchestrator_handles_schedule_tick() {
    let platform = Platform::new(fast_window());
    let (agent, handler) = FixedAgent::pair(
        "discovery-1",
        AgentType::Discovery,
        DecisionAction::UpdateCatalog,
        0.9,
        0.5,
    );
    platform.add_agent(agent, handler).await;
    let actor = platform.orchestrator.clone().spawn().await.unwrap();

    let tick = schedule_tick("orders");
    platform.channel.publish(tick.clone()).await.unwrap();
    platform.channel.publish(tick).await.unwrap();

    for _ in 0..100 {
        if !platform.events(topics::DISCOVERY).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let any duplicate work surface before counting.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let discovery = platform.events(topics::DISCOVERY).await;
    assert_eq!(discovery.len(), 1);
    assert!(matches!(
        &discovery[0],
        PlatformEvent::CatalogUpdated { pipeline_id } if pipeline_id.as_str() == "orders"
    ));
    assert_eq!(platform.orchestrator.queue().total().await, 0);

    actor.shutdown_and_wait().await.unwrap();
}

/// Test: Work waits in the queue when no agent can take it
/// Given no mapping agent
/// When a schema change is ingested
/// Then the mapping task stays queued until an agent registers
#[tokio::test]
async fn test_task_waits_for_an_eligible_agent() {
    let platform = Platform::new(Config::default());
    platform
        .orchestrator
        .ingest(&schema_changed("orders", 2))
        .await
        .unwrap();

    assert!(platform
        .orchestrator
        .dispatch_next(TaskType::Mapping)
        .await
        .is_err());
    assert_eq!(platform.orchestrator.queue().len(TaskType::Mapping).await, 1);

    let (agent, handler) = FixedAgent::pair(
        "mapper-1",
        AgentType::SchemaMapping,
        DecisionAction::UpdateMapping { schema_version: 2 },
        0.9,
        0.8,
    );
    platform.add_agent(agent, handler).await;
    let assignment = platform
        .orchestrator
        .dispatch_next(TaskType::Mapping)
        .await
        .unwrap();
    assert!(assignment.is_some());
    assert_eq!(platform.orchestrator.queue().len(TaskType::Mapping).await, 0);
}
