//! Partitioned stream consumption under flow control.
//!
//! These tests verify that a slow destination pauses consumption without
//! losing or reordering events, and that operator commands reach a running
//! stream through the controller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use pipewright::channel::{
    topics, Event, EventHandler, InMemoryEventChannel, PipelineCommand, PlatformEvent,
};
use pipewright::config::StreamConfig;
use pipewright::core::{Pipeline, PipelineConfig, PipelineId, PipelineStatus, PipelineType};
use pipewright::pipeline::io::{MemoryStreamSink, MemoryStreamSource};
use pipewright::pipeline::{PipelineController, Record, StreamEngine};

fn event(partition: u32, seq: u64) -> Record {
    Record::from([
        ("partition".to_string(), json!(partition)),
        ("seq".to_string(), json!(seq)),
    ])
}

fn config() -> StreamConfig {
    StreamConfig {
        backpressure_threshold_ms: 500,
        probe_interval_ms: 50,
        max_batch: 8,
        transport_retries: 2,
    }
}

fn control(pipeline: &str, command: PipelineCommand) -> Event {
    Event::new(
        topics::PIPELINE_CONTROL,
        "operator",
        PlatformEvent::PipelineControl {
            pipeline_id: pipeline.into(),
            command,
        },
    )
}

async fn register(controller: &PipelineController, id: &str) -> PipelineId {
    controller
        .register(Pipeline::new(id, PipelineType::Stream, PipelineConfig::default()))
        .await;
    id.into()
}

/// Test: A slow destination pauses every partition without loss
/// Given three closed partitions and a destination that turns slow
/// When the stream runs to the end
/// Then consumption paused, every event was delivered once and in order
#[tokio::test(start_paused = true)]
async fn test_slow_destination_pauses_without_loss() {
    let controller = PipelineController::new();
    let id = register(&controller, "clicks").await;
    let source = Arc::new(MemoryStreamSource::new([0, 1, 2]));
    for p in 0..3 {
        for seq in 0..20 {
            source.push(p, event(p, seq)).unwrap();
        }
        source.close_partition(p).unwrap();
    }
    let sink = Arc::new(MemoryStreamSink::with_latencies(
        std::iter::repeat(Duration::ZERO)
            .take(5)
            .chain([Duration::from_millis(900), Duration::from_millis(700)]),
    ));
    let engine = StreamEngine::new(
        source.clone(),
        sink.clone(),
        Arc::new(InMemoryEventChannel::new()),
        config(),
    );

    let report = controller.run_stream(&id, &engine).await.unwrap();

    assert!(report.backpressure_pauses >= 1);
    assert_eq!(sink.total_produced(), 60);
    for p in 0..3 {
        assert_eq!(source.committed_count(p), 20);
        assert_eq!(report.partitions[&p].processed, 20);
        let seqs: Vec<u64> = sink
            .produced(p)
            .iter()
            .map(|r| r["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>(), "partition {p} out of order");
    }
    assert_eq!(report.metrics.row_count, 60);
    assert_eq!(controller.status(&id).await.unwrap(), PipelineStatus::Completed);
}

/// Test: Pause, resume and stop reach a running stream
/// Given an open partition consumed by a running stream
/// When the operator pauses, pushes more events, resumes and stops
/// Then nothing is consumed while paused and the run ends stopped
#[tokio::test(start_paused = true)]
async fn test_operator_commands_steer_running_stream() {
    let controller = Arc::new(PipelineController::new());
    let id = register(&controller, "clicks").await;
    let source = Arc::new(MemoryStreamSource::new([0]));
    for seq in 0..5 {
        source.push(0, event(0, seq)).unwrap();
    }
    let sink = Arc::new(MemoryStreamSink::new());
    let engine = StreamEngine::new(
        source.clone(),
        sink.clone(),
        Arc::new(InMemoryEventChannel::new()),
        config(),
    );
    let running = {
        let controller = controller.clone();
        let id = id.clone();
        tokio::spawn(async move { controller.run_stream(&id, &engine).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.total_produced(), 5);

    controller.handle(&control("clicks", PipelineCommand::Pause)).await.unwrap();
    assert_eq!(controller.status(&id).await.unwrap(), PipelineStatus::Paused);
    for seq in 5..10 {
        source.push(0, event(0, seq)).unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.total_produced(), 5);

    controller.handle(&control("clicks", PipelineCommand::Resume)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sink.total_produced(), 10);

    controller.handle(&control("clicks", PipelineCommand::Stop)).await.unwrap();
    let report = running.await.unwrap().unwrap();

    assert_eq!(report.metrics.status, PipelineStatus::Stopped);
    assert_eq!(source.committed_count(0), 10);
    assert!(sink.was_closed());
    assert!(!controller.cancel_execution(&id).await);
}
