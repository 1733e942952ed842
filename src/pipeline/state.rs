//! Pipeline lifecycle shared by the batch and stream engines.
//!
//! Allowed edges:
//!
//! ```text
//! created -> scheduled (batch) | started (stream)
//! scheduled | started -> running
//! running -> completed | failed | paused
//! paused -> running
//! failed -> running        (only through `recover`, with a resolution that permits resuming)
//! any -> stopped           (terminal, operator-initiated)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::transform::{ExecutionPlan, Record};
use crate::core::{Pipeline, PipelineId, PipelineStatus, PipelineType};
use crate::healing::Resolution;
use crate::{Error, Result};

/// A state machine shared between an engine and the controller. Holders
/// lock it only for the duration of a transition.
pub type SharedMachine = Arc<Mutex<PipelineStateMachine>>;

/// One entry of a pipeline's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    pipeline: Pipeline,
    history: Vec<Transition>,
    /// Records a skip resolution excluded from every later execution.
    skipped: Vec<Record>,
}

impl PipelineStateMachine {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            history: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn shared(pipeline: Pipeline) -> SharedMachine {
        Arc::new(Mutex::new(Self::new(pipeline)))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline.id
    }

    pub fn status(&self) -> PipelineStatus {
        self.pipeline.status()
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Whether `from -> to` is an edge of the lifecycle for this pipeline
    /// type. Leaving `failed` is not one of them, see
    /// [`recover`](Self::recover).
    pub fn can_transition(&self, to: PipelineStatus) -> bool {
        use PipelineStatus::*;
        let from = self.status();
        if from == Stopped {
            return false;
        }
        match (self.pipeline.pipeline_type, from, to) {
            (_, _, Stopped) => true,
            (PipelineType::Batch, Created, Scheduled) => true,
            (PipelineType::Stream, Created, Started) => true,
            (PipelineType::Batch, Scheduled, Running) => true,
            (PipelineType::Stream, Started, Running) => true,
            (_, Running, Completed | Failed | Paused) => true,
            (_, Paused, Running) => true,
            _ => false,
        }
    }

    fn transition(&mut self, to: PipelineStatus, reason: &str) -> Result<()> {
        let from = self.status();
        if !self.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.record(to, reason);
        Ok(())
    }

    fn record(&mut self, to: PipelineStatus, reason: &str) {
        let from = self.status();
        self.pipeline.set_status(to);
        self.history.push(Transition {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
        info!(pipeline = %self.pipeline.id, %from, %to, reason, "pipeline transition");
    }

    /// Batch: wait for the next trigger.
    pub fn schedule(&mut self) -> Result<()> {
        self.transition(PipelineStatus::Scheduled, "scheduled")
    }

    /// Stream: the source connection is open.
    pub fn start(&mut self) -> Result<()> {
        self.transition(PipelineStatus::Started, "source connected")
    }

    pub fn run(&mut self) -> Result<()> {
        self.transition(PipelineStatus::Running, "execution started")
    }

    pub fn pause(&mut self) -> Result<()> {
        self.transition(PipelineStatus::Paused, "paused")
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.status() != PipelineStatus::Paused {
            return Err(Error::InvalidTransition {
                from: self.status().to_string(),
                to: PipelineStatus::Running.to_string(),
            });
        }
        self.transition(PipelineStatus::Running, "resumed")
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(PipelineStatus::Completed, "execution completed")
    }

    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.transition(PipelineStatus::Failed, reason)
    }

    /// `failed -> running`, allowed only for a successful resolution of an
    /// error on this pipeline whose strategy resumes it.
    pub fn recover(&mut self, resolution: &Resolution) -> Result<()> {
        let refused = || Error::InvalidTransition {
            from: self.status().to_string(),
            to: PipelineStatus::Running.to_string(),
        };
        if self.status() != PipelineStatus::Failed
            || resolution.pipeline_id != self.pipeline.id
            || !resolution.permits_resume()
        {
            return Err(refused());
        }
        let reason = format!("recovered by {}", resolution.strategy);
        self.record(PipelineStatus::Running, &reason);
        Ok(())
    }

    /// Move to `stopped`. Returns `false` when the pipeline was already
    /// stopped.
    pub fn stop(&mut self, reason: &str) -> Result<bool> {
        if self.status() == PipelineStatus::Stopped {
            debug!(pipeline = %self.pipeline.id, "already stopped");
            return Ok(false);
        }
        self.transition(PipelineStatus::Stopped, reason)?;
        Ok(true)
    }

    /// Exclude `record` from later executions. Returns `false` when it was
    /// already excluded.
    pub fn skip_record(&mut self, record: Record) -> bool {
        if self.skipped.contains(&record) {
            return false;
        }
        info!(pipeline = %self.pipeline.id, "record excluded from later executions");
        self.skipped.push(record);
        true
    }

    pub fn skipped_records(&self) -> &[Record] {
        &self.skipped
    }

    pub fn execution_plan(&self) -> ExecutionPlan {
        ExecutionPlan {
            transformations: self.pipeline.config.transformations.clone(),
            skipped: self.skipped.clone(),
        }
    }

    /// Merge an applied configuration delta into the pipeline settings.
    pub fn apply_settings(&mut self, delta: &BTreeMap<String, serde_json::Value>) {
        for (key, value) in delta {
            self.pipeline.config.settings.insert(key.clone(), value.clone());
        }
    }

    /// Switch to the mappings built for `schema_version`. Older versions are
    /// ignored.
    pub fn set_schema_version(&mut self, schema_version: u32) -> bool {
        if schema_version <= self.pipeline.schema_version {
            return false;
        }
        self.pipeline.schema_version = schema_version;
        true
    }
}
