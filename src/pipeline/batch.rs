//! Batch engine: extract, transform and load as one execution unit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::io::{with_transport_retries, Destination, Source};
use super::state::SharedMachine;
use super::transform::{ExecutionPlan, RecordFailure};
use super::{announce_completion, announce_failure, ExecutionMetrics};
use crate::channel::EventChannel;
use crate::core::{ExecutionId, PipelineStatus};
use crate::util::elapsed_ms;
use crate::{Error, Result};

const DEFAULT_TRANSPORT_ATTEMPTS: u32 = 3;
const DEFAULT_TRANSPORT_BACKOFF: Duration = Duration::from_millis(100);

/// Result of a batch execution that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub metrics: ExecutionMetrics,
    /// Records rejected by a transformation, with their error.
    pub failures: Vec<RecordFailure>,
}

struct Transfer {
    loaded: u64,
    failures: Vec<RecordFailure>,
    cancelled: bool,
}

pub struct BatchEngine {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    channel: Arc<dyn EventChannel>,
    transport_attempts: u32,
    transport_backoff: Duration,
}

impl BatchEngine {
    pub fn new(
        source: Arc<dyn Source>,
        destination: Arc<dyn Destination>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            source,
            destination,
            channel,
            transport_attempts: DEFAULT_TRANSPORT_ATTEMPTS,
            transport_backoff: DEFAULT_TRANSPORT_BACKOFF,
        }
    }

    pub fn with_transport_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.transport_attempts = attempts.max(1);
        self.transport_backoff = backoff;
        self
    }

    /// Execute one run of a scheduled batch pipeline.
    ///
    /// Single-record transformation failures are collected and the run
    /// goes on. Any other failure moves the pipeline to `failed`, publishes
    /// a `PipelineFailed` event and is returned. Cancellation is checked
    /// between records; a cancelled run loads nothing.
    ///
    /// A `failed` pipeline is refused. Only the self-healing loop brings it
    /// back, through [`attempt`](Self::attempt) and a resolution.
    pub async fn run(&self, machine: &SharedMachine, cancel: &CancellationToken) -> Result<BatchReport> {
        let execution_id = ExecutionId::new();
        let started = Utc::now();
        let (pipeline_id, pipeline_type, plan) = {
            let mut m = machine.lock().await;
            match m.status() {
                PipelineStatus::Scheduled => m.run()?,
                PipelineStatus::Running => {}
                other => {
                    return Err(Error::InvalidTransition {
                        from: other.to_string(),
                        to: PipelineStatus::Running.to_string(),
                    })
                }
            }
            (
                m.pipeline_id().clone(),
                m.pipeline().pipeline_type,
                m.execution_plan(),
            )
        };
        info!(pipeline = %pipeline_id, execution = %execution_id, "batch execution started");

        match self.execute(&plan, cancel).await {
            Ok(transfer) => {
                let status = {
                    let mut m = machine.lock().await;
                    if transfer.cancelled {
                        m.stop("execution cancelled")?;
                    } else if m.status() == PipelineStatus::Running {
                        m.complete()?;
                    }
                    m.status()
                };
                let metrics = ExecutionMetrics {
                    execution_id,
                    row_count: transfer.loaded,
                    failed_count: transfer.failures.len() as u64,
                    duration_ms: elapsed_ms(started, Utc::now()),
                    status,
                };
                info!(
                    pipeline = %pipeline_id,
                    rows = metrics.row_count,
                    failed = metrics.failed_count,
                    status = %status,
                    "batch execution finished"
                );
                announce_completion(self.channel.as_ref(), &pipeline_id, &metrics).await;
                Ok(BatchReport {
                    metrics,
                    failures: transfer.failures,
                })
            }
            Err(e) => {
                {
                    let mut m = machine.lock().await;
                    if m.status() == PipelineStatus::Running {
                        m.fail(&e.to_string())?;
                    }
                }
                announce_failure(
                    self.channel.as_ref(),
                    &pipeline_id,
                    pipeline_type,
                    execution_id,
                    &e,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Re-run the execution of a `failed` pipeline on behalf of the
    /// self-healing loop.
    ///
    /// The pipeline stays `failed` whatever the outcome; the resolution that
    /// follows decides its status. A failed attempt is returned without a
    /// `PipelineFailed` event, since the error it retries is still open.
    pub async fn attempt(&self, machine: &SharedMachine, cancel: &CancellationToken) -> Result<BatchReport> {
        let execution_id = ExecutionId::new();
        let started = Utc::now();
        let (pipeline_id, plan) = {
            let m = machine.lock().await;
            if m.status() != PipelineStatus::Failed {
                return Err(Error::InvalidTransition {
                    from: m.status().to_string(),
                    to: PipelineStatus::Running.to_string(),
                });
            }
            (m.pipeline_id().clone(), m.execution_plan())
        };
        info!(pipeline = %pipeline_id, execution = %execution_id, "batch retry attempt started");

        let transfer = self.execute(&plan, cancel).await?;
        if transfer.cancelled {
            return Err(Error::StructuralFailure(format!(
                "retry of {pipeline_id} cancelled"
            )));
        }
        let metrics = ExecutionMetrics {
            execution_id,
            row_count: transfer.loaded,
            failed_count: transfer.failures.len() as u64,
            duration_ms: elapsed_ms(started, Utc::now()),
            status: PipelineStatus::Completed,
        };
        info!(pipeline = %pipeline_id, rows = metrics.row_count, "batch retry attempt loaded");
        announce_completion(self.channel.as_ref(), &pipeline_id, &metrics).await;
        Ok(BatchReport {
            metrics,
            failures: transfer.failures,
        })
    }

    async fn execute(&self, plan: &ExecutionPlan, cancel: &CancellationToken) -> Result<Transfer> {
        self.retrying("open source", || self.source.open()).await?;
        let result = match self.retrying("open destination", || self.destination.open()).await {
            Ok(()) => {
                let transfer = self.transfer(plan, cancel).await;
                if let Err(e) = self.destination.close().await {
                    warn!(error = %e, "destination close failed");
                }
                transfer
            }
            Err(e) => Err(e),
        };
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "source close failed");
        }
        result
    }

    async fn transfer(&self, plan: &ExecutionPlan, cancel: &CancellationToken) -> Result<Transfer> {
        let records = self.retrying("extract", || self.source.extract()).await?;
        debug!(records = records.len(), "extracted");

        let mut output = Vec::with_capacity(records.len());
        let mut failures = Vec::new();
        for record in &records {
            if cancel.is_cancelled() {
                return Ok(Transfer {
                    loaded: 0,
                    failures,
                    cancelled: true,
                });
            }
            match plan.apply(record) {
                Ok(Some(transformed)) => output.push(transformed),
                Ok(None) => debug!("skipped record dropped"),
                Err(failure) => {
                    warn!(
                        transformation = ?failure.transformation,
                        error = %failure.error,
                        "record rejected"
                    );
                    failures.push(failure);
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(Transfer {
                loaded: 0,
                failures,
                cancelled: true,
            });
        }

        let loaded = self
            .retrying("load", || self.destination.load(&output))
            .await?;
        Ok(Transfer {
            loaded,
            failures,
            cancelled: false,
        })
    }

    async fn retrying<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_transport_retries(what, self.transport_attempts, self.transport_backoff, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{topics, InMemoryEventChannel, PlatformEvent};
    use crate::core::{Pipeline, PipelineConfig, PipelineType};
    use crate::pipeline::io::{MemoryDestination, MemorySource};
    use crate::pipeline::state::PipelineStateMachine;
    use crate::pipeline::transform::{FieldType, Operation, Record};
    use serde_json::json;

    struct Harness {
        engine: BatchEngine,
        source: Arc<MemorySource>,
        destination: Arc<MemoryDestination>,
        channel: Arc<InMemoryEventChannel>,
        machine: SharedMachine,
    }

    fn harness(records: Vec<Record>) -> Harness {
        let source = Arc::new(MemorySource::new(records));
        let destination = Arc::new(MemoryDestination::new());
        let channel = Arc::new(InMemoryEventChannel::new());
        let engine = BatchEngine::new(source.clone(), destination.clone(), channel.clone())
            .with_transport_retries(2, Duration::from_millis(1));
        let config = PipelineConfig {
            source: "memory".into(),
            destination: "memory".into(),
            transformations: vec![crate::pipeline::transform::Transformation::new(
                "amount",
                Operation::Cast {
                    source: "amount".into(),
                },
                "amount",
                FieldType::Integer,
            )],
            ..PipelineConfig::default()
        };
        let machine = PipelineStateMachine::shared(Pipeline::new("orders", PipelineType::Batch, config));
        Harness {
            engine,
            source,
            destination,
            channel,
            machine,
        }
    }

    fn row(amount: serde_json::Value) -> Record {
        Record::from([("amount".to_string(), amount)])
    }

    #[tokio::test]
    async fn test_run_loads_and_completes() {
        let h = harness(vec![row(json!("1")), row(json!("2")), row(json!("3"))]);
        h.machine.lock().await.schedule().unwrap();

        let report = h.engine.run(&h.machine, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.metrics.row_count, 3);
        assert_eq!(report.metrics.status, PipelineStatus::Completed);
        assert_eq!(h.destination.loaded()[0]["amount"], json!(1));
        assert!(h.source.was_closed());
        assert!(h.destination.was_closed());
        let events = h.channel.published(topics::PIPELINE_EVENTS).await;
        assert!(matches!(
            &events[0].body,
            PlatformEvent::ExecutionCompleted { metrics, .. } if metrics.row_count == 3
        ));
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_run() {
        let h = harness(vec![row(json!("1")), row(json!("oops")), row(json!("3"))]);
        h.machine.lock().await.schedule().unwrap();

        let report = h.engine.run(&h.machine, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.metrics.row_count, 2);
        assert_eq!(report.metrics.failed_count, 1);
        assert_eq!(report.failures[0].record, row(json!("oops")));
        assert_eq!(report.metrics.status, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn test_structural_failure_fails_pipeline() {
        let h = harness(vec![row(json!("1"))]);
        h.machine.lock().await.schedule().unwrap();
        h.source
            .fail_next(Error::StructuralFailure("connection lost".into()));

        let result = h.engine.run(&h.machine, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::StructuralFailure(_))));
        assert_eq!(h.machine.lock().await.status(), PipelineStatus::Failed);
        assert!(h.source.was_closed());
        let errors = h.channel.published(topics::PIPELINE_ERRORS).await;
        assert!(matches!(&errors[0].body, PlatformEvent::PipelineFailed { error } if error.pipeline_id.as_str() == "orders"));
        assert!(h.destination.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_loads_nothing() {
        let h = harness(vec![row(json!("1"))]);
        h.machine.lock().await.schedule().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.engine.run(&h.machine, &cancel).await.unwrap();

        assert_eq!(report.metrics.status, PipelineStatus::Stopped);
        assert!(h.destination.loaded().is_empty());
        assert!(h.destination.was_closed());
    }

    #[tokio::test]
    async fn test_unscheduled_pipeline_is_refused() {
        let h = harness(vec![]);
        let result = h.engine.run(&h.machine, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    async fn failed(h: &Harness) {
        h.machine.lock().await.schedule().unwrap();
        h.source
            .fail_next(Error::StructuralFailure("connection lost".into()));
        assert!(h.engine.run(&h.machine, &CancellationToken::new()).await.is_err());
        assert_eq!(h.machine.lock().await.status(), PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_pipeline_is_refused() {
        let h = harness(vec![row(json!("1"))]);
        failed(&h).await;

        let result = h.engine.run(&h.machine, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        assert_eq!(h.machine.lock().await.status(), PipelineStatus::Failed);
        assert!(h.destination.loaded().is_empty());
        assert_eq!(h.channel.published(topics::PIPELINE_ERRORS).await.len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_loads_without_leaving_failed() {
        let h = harness(vec![row(json!("1")), row(json!("2"))]);
        failed(&h).await;

        let report = h.engine.attempt(&h.machine, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.metrics.row_count, 2);
        assert_eq!(h.destination.loaded().len(), 2);
        assert_eq!(h.machine.lock().await.status(), PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_not_announced() {
        let h = harness(vec![row(json!("1"))]);
        failed(&h).await;
        h.source
            .fail_next(Error::StructuralFailure("still down".into()));

        let result = h.engine.attempt(&h.machine, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::StructuralFailure(_))));
        assert_eq!(h.channel.published(topics::PIPELINE_ERRORS).await.len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_requires_failed_pipeline() {
        let h = harness(vec![row(json!("1"))]);
        h.machine.lock().await.schedule().unwrap();

        let result = h.engine.attempt(&h.machine, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        assert!(h.destination.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_record_fails_run_then_skip_excludes_it() {
        let h = harness(vec![row(json!("1")), row(json!("2")), row(json!("3"))]);
        h.destination.reject(row(json!(2)));
        h.machine.lock().await.schedule().unwrap();

        let result = h.engine.run(&h.machine, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::RecordRejected { .. })));
        let errors = h.channel.published(topics::PIPELINE_ERRORS).await;
        assert!(matches!(
            &errors[0].body,
            PlatformEvent::PipelineFailed { error } if error.context["record"] == json!({ "amount": 2 })
        ));

        h.machine.lock().await.skip_record(row(json!(2)));
        let report = h.engine.attempt(&h.machine, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.metrics.row_count, 2);
        assert_eq!(h.destination.loaded(), vec![row(json!(1)), row(json!(3))]);
    }
}
