//! Owner of the pipeline state machines.
//!
//! Engines borrow a machine for one execution; everything else (operator
//! commands, mapping updates, self-healing outcomes) reaches a pipeline
//! through the controller.
//!
//! Remediation re-runs the failed execution through the engine attached to
//! the pipeline. The pipeline stays `failed` while it does; the resolution
//! published afterwards moves it on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::{BatchEngine, BatchReport};
use super::state::{PipelineStateMachine, SharedMachine};
use super::stream::{StreamEngine, StreamReport};
use crate::channel::{Event, EventHandler, PipelineCommand, PlatformEvent, ProcessedEvents};
use crate::core::{Pipeline, PipelineId, PipelineStatus, PipelineType};
use super::transform::Record;
use crate::healing::{ConfigDelta, ErrorId, PipelineError, RemediationExecutor, Resolution};
use crate::{Error, Result};

/// The engine that re-runs a pipeline's executions during remediation.
#[derive(Clone)]
enum Engine {
    Batch(Arc<BatchEngine>),
    Stream(Arc<StreamEngine>),
}

#[derive(Default)]
pub struct PipelineController {
    machines: RwLock<HashMap<PipelineId, SharedMachine>>,
    engines: RwLock<HashMap<PipelineId, Engine>>,
    /// Cancellation of the execution currently running per pipeline.
    executions: Mutex<HashMap<PipelineId, CancellationToken>>,
    /// Errors whose batch re-run already loaded everything. Their
    /// resolution completes the pipeline instead of leaving it running.
    rerun_complete: Mutex<HashSet<ErrorId>>,
    processed: Mutex<ProcessedEvents>,
}

impl PipelineController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a pipeline. Registering an id twice replaces
    /// nothing and returns the existing machine.
    pub async fn register(&self, pipeline: Pipeline) -> SharedMachine {
        let mut machines = self.machines.write().await;
        machines
            .entry(pipeline.id.clone())
            .or_insert_with(|| {
                info!(pipeline = %pipeline.id, kind = %pipeline.pipeline_type, "pipeline registered");
                PipelineStateMachine::shared(pipeline)
            })
            .clone()
    }

    pub async fn machine(&self, pipeline_id: &PipelineId) -> Result<SharedMachine> {
        self.machines
            .read()
            .await
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| Error::PipelineNotFound(pipeline_id.clone()))
    }

    /// Use `engine` to re-run executions of a registered batch pipeline.
    pub async fn attach_batch(&self, pipeline_id: &PipelineId, engine: Arc<BatchEngine>) -> Result<()> {
        self.attach(pipeline_id, Engine::Batch(engine)).await
    }

    /// Use `engine` to reconnect a registered stream pipeline.
    pub async fn attach_stream(&self, pipeline_id: &PipelineId, engine: Arc<StreamEngine>) -> Result<()> {
        self.attach(pipeline_id, Engine::Stream(engine)).await
    }

    async fn attach(&self, pipeline_id: &PipelineId, engine: Engine) -> Result<()> {
        let pipeline_type = self.machine(pipeline_id).await?.lock().await.pipeline().pipeline_type;
        let matches = matches!(
            (&engine, pipeline_type),
            (Engine::Batch(_), PipelineType::Batch) | (Engine::Stream(_), PipelineType::Stream)
        );
        if !matches {
            return Err(Error::Validation(format!(
                "{pipeline_type} pipeline {pipeline_id} cannot use this engine"
            )));
        }
        self.engines.write().await.insert(pipeline_id.clone(), engine);
        Ok(())
    }

    pub async fn status(&self, pipeline_id: &PipelineId) -> Result<PipelineStatus> {
        Ok(self.machine(pipeline_id).await?.lock().await.status())
    }

    pub async fn pipeline_ids(&self) -> Vec<PipelineId> {
        let mut ids: Vec<_> = self.machines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run one batch execution of `pipeline_id`, cancellable through
    /// [`cancel_execution`](Self::cancel_execution).
    pub async fn run_batch(&self, pipeline_id: &PipelineId, engine: &BatchEngine) -> Result<BatchReport> {
        let (machine, cancel) = self.begin_execution(pipeline_id).await?;
        let result = engine.run(&machine, &cancel).await;
        self.finish_execution(pipeline_id).await;
        result
    }

    pub async fn run_stream(&self, pipeline_id: &PipelineId, engine: &StreamEngine) -> Result<StreamReport> {
        let (machine, cancel) = self.begin_execution(pipeline_id).await?;
        let result = engine.run(&machine, &cancel).await;
        self.finish_execution(pipeline_id).await;
        result
    }

    async fn begin_execution(&self, pipeline_id: &PipelineId) -> Result<(SharedMachine, CancellationToken)> {
        let machine = self.machine(pipeline_id).await?;
        let mut executions = self.executions.lock().await;
        if executions.contains_key(pipeline_id) {
            return Err(Error::InvalidTransition {
                from: machine.lock().await.status().to_string(),
                to: PipelineStatus::Running.to_string(),
            });
        }
        let cancel = CancellationToken::new();
        executions.insert(pipeline_id.clone(), cancel.clone());
        Ok((machine, cancel))
    }

    async fn finish_execution(&self, pipeline_id: &PipelineId) {
        self.executions.lock().await.remove(pipeline_id);
    }

    /// Ask the running execution of `pipeline_id` to wind down. Returns
    /// `false` when nothing was running.
    pub async fn cancel_execution(&self, pipeline_id: &PipelineId) -> bool {
        match self.executions.lock().await.get(pipeline_id) {
            Some(cancel) => {
                info!(pipeline = %pipeline_id, "cancelling execution");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Operator stop: cancel any execution and move to `stopped`. Stopping
    /// a stopped pipeline is a no-op.
    pub async fn stop_pipeline(&self, pipeline_id: &PipelineId, reason: &str) -> Result<bool> {
        let machine = self.machine(pipeline_id).await?;
        self.cancel_execution(pipeline_id).await;
        let stopped = machine.lock().await.stop(reason)?;
        Ok(stopped)
    }

    async fn apply_command(&self, pipeline_id: &PipelineId, command: PipelineCommand) -> Result<()> {
        let machine = self.machine(pipeline_id).await?;
        match command {
            PipelineCommand::Stop => {
                self.stop_pipeline(pipeline_id, "stop requested").await?;
            }
            PipelineCommand::Pause => {
                let mut m = machine.lock().await;
                match m.status() {
                    PipelineStatus::Paused => debug!(pipeline = %pipeline_id, "already paused"),
                    PipelineStatus::Running => m.pause()?,
                    other => debug!(pipeline = %pipeline_id, status = %other, "pause ignored"),
                }
            }
            PipelineCommand::Resume => {
                let mut m = machine.lock().await;
                match m.status() {
                    PipelineStatus::Paused => m.resume()?,
                    PipelineStatus::Failed => {
                        warn!(pipeline = %pipeline_id, "resume of a failed pipeline needs a resolution")
                    }
                    other => debug!(pipeline = %pipeline_id, status = %other, "resume ignored"),
                }
            }
        }
        Ok(())
    }

    async fn apply_resolution(&self, resolution: &Resolution) -> Result<()> {
        let machine = self.machine(&resolution.pipeline_id).await?;
        let mut m = machine.lock().await;
        if let Some(delta) = &resolution.delta {
            m.apply_settings(delta);
        }
        if m.status() == PipelineStatus::Failed {
            m.recover(resolution)?;
            if self.rerun_complete.lock().await.remove(&resolution.error_id) {
                m.complete()?;
            }
        } else {
            debug!(pipeline = %resolution.pipeline_id, status = %m.status(), "resolution for a pipeline not failed");
        }
        Ok(())
    }

    /// A stopped pipeline cannot be remediated.
    async fn remediable(&self, error: &PipelineError) -> Result<SharedMachine> {
        let machine = self.machine(&error.pipeline_id).await?;
        let status = machine.lock().await.status();
        if status == PipelineStatus::Stopped {
            return Err(Error::StructuralFailure(format!(
                "pipeline {} is stopped",
                error.pipeline_id
            )));
        }
        Ok(machine)
    }

    /// Re-run the failed execution behind `error` with the attached engine.
    async fn rerun(&self, error: &PipelineError) -> Result<()> {
        let engine = self
            .engines
            .read()
            .await
            .get(&error.pipeline_id)
            .cloned()
            .ok_or_else(|| {
                Error::StructuralFailure(format!("no engine attached to {}", error.pipeline_id))
            })?;
        let (machine, cancel) = self.begin_execution(&error.pipeline_id).await?;
        let result = match engine {
            Engine::Batch(engine) => engine.attempt(&machine, &cancel).await.map(|report| {
                info!(pipeline = %error.pipeline_id, rows = report.metrics.row_count, "failed execution re-run");
                true
            }),
            Engine::Stream(engine) => engine.reconnect().await.map(|()| false),
        };
        self.finish_execution(&error.pipeline_id).await;
        if result? {
            self.rerun_complete.lock().await.insert(error.id);
        }
        Ok(())
    }

    async fn owns(&self, event: &Event) -> bool {
        let machines = self.machines.read().await;
        event
            .body
            .pipeline_id()
            .is_some_and(|id| machines.contains_key(id))
    }
}

#[async_trait]
impl EventHandler for PipelineController {
    /// Control, mapping and self-healing events for registered pipelines.
    async fn handle(&self, event: &Event) -> Result<()> {
        if !self.owns(event).await {
            return Ok(());
        }
        if !self.processed.lock().await.first_delivery(event.id) {
            debug!(event_id = %event.id, "duplicate delivery ignored");
            return Ok(());
        }

        match &event.body {
            PlatformEvent::PipelineControl { pipeline_id, command } => {
                info!(pipeline = %pipeline_id, ?command, "pipeline control");
                self.apply_command(pipeline_id, *command).await?;
            }
            PlatformEvent::MappingUpdated {
                pipeline_id,
                schema_version,
            } => {
                let machine = self.machine(pipeline_id).await?;
                if machine.lock().await.set_schema_version(*schema_version) {
                    info!(pipeline = %pipeline_id, schema_version, "mappings updated");
                }
            }
            PlatformEvent::ErrorResolved { resolution } => {
                self.apply_resolution(resolution).await?;
            }
            PlatformEvent::ErrorEscalated { resolution } => {
                warn!(
                    pipeline = %resolution.pipeline_id,
                    error_id = %resolution.error_id,
                    attempts = resolution.attempts,
                    "pipeline needs operator attention"
                );
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl RemediationExecutor for PipelineController {
    async fn retry(&self, error: &PipelineError) -> Result<()> {
        self.remediable(error).await?;
        debug!(pipeline = %error.pipeline_id, error_id = %error.id, "retrying failed execution");
        self.rerun(error).await
    }

    /// Exclude the record named in the error context, then re-run.
    async fn skip(&self, error: &PipelineError) -> Result<()> {
        let machine = self.remediable(error).await?;
        let offending = error.context.get("record").cloned().ok_or_else(|| {
            Error::Validation(format!("error {} names no offending record", error.id))
        })?;
        let record: Record = serde_json::from_value(offending)?;
        if machine.lock().await.skip_record(record) {
            info!(pipeline = %error.pipeline_id, error_id = %error.id, "skipping offending record");
        }
        self.rerun(error).await
    }

    async fn adjust_config(&self, error: &PipelineError, delta: &ConfigDelta) -> Result<()> {
        let machine = self.remediable(error).await?;
        machine.lock().await.apply_settings(delta);
        info!(pipeline = %error.pipeline_id, keys = delta.len(), "configuration adjusted");
        self.rerun(error).await
    }
}
