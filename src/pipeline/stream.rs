//! Stream engine.
//!
//! Each partition is consumed by its own loop, strictly one event at a
//! time, so delivery order within a partition equals source order. Distinct
//! partitions run concurrently.
//!
//! Backpressure: when an acknowledgement takes longer than the configured
//! threshold, every partition stops polling. The partition that saw the
//! slow acknowledgement probes the sink until latency is back under the
//! threshold. Nothing is dropped: uncommitted events are polled again once
//! consumption resumes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::io::{with_transport_retries, StreamEvent, StreamSink, StreamSource};
use super::state::SharedMachine;
use super::transform::{ExecutionPlan, RecordFailure};
use super::{announce_completion, announce_failure, ExecutionMetrics};
use crate::channel::EventChannel;
use crate::config::StreamConfig;
use crate::core::{ExecutionId, PipelineStatus};
use crate::util::elapsed_ms;
use crate::{Error, Result};

/// Per-partition counters of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionStats {
    /// Events whose offset was committed, including rejected records.
    pub processed: u64,
    /// Events rejected by a transformation.
    pub failed: u64,
    pub last_offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub metrics: ExecutionMetrics,
    pub partitions: BTreeMap<u32, PartitionStats>,
    pub backpressure_pauses: u32,
    pub failures: Vec<RecordFailure>,
}

#[derive(Default)]
struct FlowControl {
    paused: AtomicBool,
    pauses: AtomicU32,
}

struct PartitionOutcome {
    stats: PartitionStats,
    failures: Vec<RecordFailure>,
}

pub struct StreamEngine {
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn StreamSink>,
    channel: Arc<dyn EventChannel>,
    config: StreamConfig,
}

impl StreamEngine {
    pub fn new(
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn StreamSink>,
        channel: Arc<dyn EventChannel>,
        config: StreamConfig,
    ) -> Self {
        Self {
            source,
            sink,
            channel,
            config,
        }
    }

    /// Consume every partition until the source ends, the pipeline is
    /// stopped or `cancel` fires.
    ///
    /// Cancellation is cooperative: the event in flight is finished and
    /// committed, the rest stay uncommitted for the next run.
    ///
    /// A `failed` or finished pipeline is refused. A recovered one resumes
    /// from its committed offsets.
    pub async fn run(&self, machine: &SharedMachine, cancel: &CancellationToken) -> Result<StreamReport> {
        let execution_id = ExecutionId::new();
        let started = Utc::now();
        let (pipeline_id, pipeline_type) = {
            let m = machine.lock().await;
            admit(m.status())?;
            (m.pipeline_id().clone(), m.pipeline().pipeline_type)
        };

        let result = self.execute(machine, cancel).await;
        if let Err(e) = self.source.disconnect().await {
            warn!(pipeline = %pipeline_id, error = %e, "source disconnect failed");
        }
        if let Err(e) = self.sink.close().await {
            warn!(pipeline = %pipeline_id, error = %e, "sink close failed");
        }

        match result {
            Ok((partitions, failures, pauses)) => {
                let status = {
                    let mut m = machine.lock().await;
                    if cancel.is_cancelled() {
                        m.stop("execution cancelled")?;
                    } else if m.status() == PipelineStatus::Running {
                        m.complete()?;
                    }
                    m.status()
                };
                let metrics = ExecutionMetrics {
                    execution_id,
                    row_count: partitions.values().map(|p| p.processed - p.failed).sum(),
                    failed_count: failures.len() as u64,
                    duration_ms: elapsed_ms(started, Utc::now()),
                    status,
                };
                info!(
                    pipeline = %pipeline_id,
                    rows = metrics.row_count,
                    pauses,
                    status = %status,
                    "stream execution finished"
                );
                announce_completion(self.channel.as_ref(), &pipeline_id, &metrics).await;
                Ok(StreamReport {
                    metrics,
                    partitions,
                    backpressure_pauses: pauses,
                    failures,
                })
            }
            Err(e) => {
                {
                    let mut m = machine.lock().await;
                    if matches!(m.status(), PipelineStatus::Running | PipelineStatus::Paused) {
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

    async fn execute(
        &self,
        machine: &SharedMachine,
        cancel: &CancellationToken,
    ) -> Result<(BTreeMap<u32, PartitionStats>, Vec<RecordFailure>, u32)> {
        with_transport_retries("connect", self.attempts(), self.config.probe_interval(), || {
            self.source.connect()
        })
        .await?;

        let plan = {
            let mut m = machine.lock().await;
            match m.status() {
                PipelineStatus::Created => {
                    m.start()?;
                    m.run()?;
                }
                PipelineStatus::Started => m.run()?,
                // Recovered by the self-healing loop, or paused by an
                // operator, in which case the partitions idle until resumed.
                PipelineStatus::Running | PipelineStatus::Paused => {}
                other => admit(other)?,
            }
            m.execution_plan()
        };

        // Stops sibling partitions when one of them fails.
        let run_cancel = cancel.child_token();
        let flow = FlowControl::default();
        let partitions = self.source.partitions();
        debug!(partitions = partitions.len(), "consuming stream");

        let outcomes = join_all(partitions.iter().map(|&partition| {
            self.consume_partition(partition, &plan, machine, &run_cancel, &flow)
        }))
        .await;

        let mut stats = BTreeMap::new();
        let mut failures = Vec::new();
        let mut first_error = None;
        for (partition, outcome) in partitions.into_iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    stats.insert(partition, outcome.stats);
                    failures.extend(outcome.failures);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok((stats, failures, flow.pauses.load(Ordering::SeqCst)))
    }

    async fn consume_partition(
        &self,
        partition: u32,
        plan: &ExecutionPlan,
        machine: &SharedMachine,
        cancel: &CancellationToken,
        flow: &FlowControl,
    ) -> Result<PartitionOutcome> {
        let result = self
            .consume(partition, plan, machine, cancel, flow)
            .await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    }

    async fn consume(
        &self,
        partition: u32,
        plan: &ExecutionPlan,
        machine: &SharedMachine,
        cancel: &CancellationToken,
        flow: &FlowControl,
    ) -> Result<PartitionOutcome> {
        let mut outcome = PartitionOutcome {
            stats: PartitionStats::default(),
            failures: Vec::new(),
        };
        let idle = self.config.probe_interval();

        'poll: loop {
            if cancel.is_cancelled() {
                break;
            }
            let status = machine.lock().await.status();
            match status {
                PipelineStatus::Stopped => break,
                PipelineStatus::Paused => {
                    tokio::time::sleep(idle).await;
                    continue;
                }
                _ => {}
            }
            if flow.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(idle).await;
                continue;
            }

            let polled = with_transport_retries("poll", self.attempts(), idle, || {
                self.source.poll(partition, self.config.max_batch.max(1))
            })
            .await?;
            let Some(events) = polled else {
                debug!(partition, "partition ended");
                break;
            };
            if events.is_empty() {
                tokio::time::sleep(idle).await;
                continue;
            }

            for event in events {
                let slow = self.process(&event, plan, &mut outcome).await?;
                if slow {
                    self.throttle(partition, flow, cancel).await?;
                    continue 'poll;
                }
                if cancel.is_cancelled() {
                    break 'poll;
                }
            }
        }
        Ok(outcome)
    }

    /// Transform, produce and commit one event. Returns whether the sink
    /// acknowledged slower than the backpressure threshold.
    async fn process(
        &self,
        event: &StreamEvent,
        plan: &ExecutionPlan,
        outcome: &mut PartitionOutcome,
    ) -> Result<bool> {
        let mut slow = false;
        match plan.apply(&event.record) {
            Ok(None) => {
                debug!(partition = event.partition, offset = event.offset, "skipped record dropped");
            }
            Ok(Some(record)) => {
                let latency = with_transport_retries(
                    "produce",
                    self.attempts(),
                    self.config.probe_interval(),
                    || self.sink.produce(event.partition, &record),
                )
                .await?;
                slow = latency > self.config.backpressure_threshold();
            }
            Err(failure) => {
                warn!(
                    partition = event.partition,
                    offset = event.offset,
                    error = %failure.error,
                    "record rejected"
                );
                outcome.stats.failed += 1;
                outcome.failures.push(failure);
            }
        }

        with_transport_retries("commit", self.attempts(), self.config.probe_interval(), || {
            self.source.commit(event.partition, event.offset)
        })
        .await?;
        outcome.stats.processed += 1;
        outcome.stats.last_offset = Some(event.offset);
        Ok(slow)
    }

    /// Pause consumption until the sink is fast again. Only one partition
    /// probes at a time; the others wait on the shared flag.
    async fn throttle(&self, partition: u32, flow: &FlowControl, cancel: &CancellationToken) -> Result<()> {
        if flow
            .paused
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let pauses = flow.pauses.fetch_add(1, Ordering::SeqCst) + 1;
        info!(partition, pauses, "backpressure: consumption paused");

        let threshold = self.config.backpressure_threshold();
        let result = loop {
            tokio::time::sleep(self.config.probe_interval()).await;
            if cancel.is_cancelled() {
                break Ok(());
            }
            match self.sink.probe().await {
                Ok(latency) if latency <= threshold => {
                    info!(
                        partition,
                        latency_ms = latency.as_millis() as u64,
                        "backpressure: consumption resumed"
                    );
                    break Ok(());
                }
                Ok(latency) => {
                    debug!(partition, latency_ms = latency.as_millis() as u64, "sink still slow");
                }
                Err(Error::TransportFailure(msg)) => {
                    debug!(partition, error = %msg, "probe failed");
                }
                Err(e) => break Err(e),
            }
        };
        flow.paused.store(false, Ordering::SeqCst);
        result
    }

    /// Check that the source and the sink answer again after a failure.
    ///
    /// Nothing is consumed: the next [`run`](Self::run) of the recovered
    /// pipeline picks up at the committed offsets.
    pub async fn reconnect(&self) -> Result<()> {
        with_transport_retries("connect", self.attempts(), self.config.probe_interval(), || {
            self.source.connect()
        })
        .await?;
        let probed = with_transport_retries("probe", self.attempts(), self.config.probe_interval(), || {
            self.sink.probe()
        })
        .await;
        if let Err(e) = self.source.disconnect().await {
            warn!(error = %e, "source disconnect failed");
        }
        probed.map(|latency| {
            debug!(latency_ms = latency.as_millis() as u64, "stream reachable again");
        })
    }

    fn attempts(&self) -> u32 {
        self.config.transport_retries.max(1)
    }
}

/// Statuses a stream execution may start from.
fn admit(status: PipelineStatus) -> Result<()> {
    match status {
        PipelineStatus::Created
        | PipelineStatus::Started
        | PipelineStatus::Running
        | PipelineStatus::Paused => Ok(()),
        other => Err(Error::InvalidTransition {
            from: other.to_string(),
            to: PipelineStatus::Running.to_string(),
        }),
    }
}
