//! Pipeline type definitions shared by the batch and stream engines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::transform::Transformation;

/// Identifier of a configured pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub String);

impl PipelineId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PipelineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PipelineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one execution (run) of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Batch,
    Stream,
}

impl std::fmt::Display for PipelineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineType::Batch => write!(f, "batch"),
            PipelineType::Stream => write!(f, "stream"),
        }
    }
}

/// Lifecycle status of a pipeline.
///
/// `Scheduled` is the batch waiting state, `Started` the stream one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Created,
    Scheduled,
    Started,
    Running,
    Paused,
    Completed,
    Failed,
    /// Operator-initiated, terminal.
    Stopped,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Stopped)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Created => write!(f, "created"),
            PipelineStatus::Scheduled => write!(f, "scheduled"),
            PipelineStatus::Started => write!(f, "started"),
            PipelineStatus::Running => write!(f, "running"),
            PipelineStatus::Paused => write!(f, "paused"),
            PipelineStatus::Completed => write!(f, "completed"),
            PipelineStatus::Failed => write!(f, "failed"),
            PipelineStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Source, destination and transformation settings of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    /// Tunables such as `batch_size`, adjustable by the self-healing loop.
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// A configured extract-transform-load unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub pipeline_type: PipelineType,
    status: PipelineStatus,
    pub config: PipelineConfig,
    pub schema_version: u32,
}

impl Pipeline {
    pub fn new(id: impl Into<PipelineId>, pipeline_type: PipelineType, config: PipelineConfig) -> Self {
        Self {
            id: id.into(),
            pipeline_type,
            status: PipelineStatus::Created,
            config,
            schema_version: 1,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Only the state machine moves a pipeline between statuses.
    pub(crate) fn set_status(&mut self, status: PipelineStatus) {
        self.status = status;
    }
}
