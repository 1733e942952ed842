//! Task data model.
//!
//! Tasks are the units of work submitted to an agent type. A task is
//! immutable once created except for its assignment and the retry count
//! bumped when an agent times out on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::core::PipelineId;
use crate::error::{Error, Result};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of work a task represents.
///
/// The declaration order is the dependency order used when planning work
/// for a single pipeline: mapping depends on fresh discovery output, and
/// error resolution runs against the mapped pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Discovery,
    Mapping,
    ErrorResolution,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::Discovery,
        TaskType::Mapping,
        TaskType::ErrorResolution,
    ];

    /// Position in the discovery -> mapping -> error_resolution chain.
    pub fn dependency_rank(&self) -> u8 {
        match self {
            TaskType::Discovery => 0,
            TaskType::Mapping => 1,
            TaskType::ErrorResolution => 2,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Discovery => write!(f, "discovery"),
            TaskType::Mapping => write!(f, "mapping"),
            TaskType::ErrorResolution => write!(f, "error_resolution"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discovery" => Ok(TaskType::Discovery),
            "mapping" => Ok(TaskType::Mapping),
            "error_resolution" => Ok(TaskType::ErrorResolution),
            other => Err(Error::Validation(format!("unknown task type: {other}"))),
        }
    }
}

/// A unit of work waiting for, or held by, an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    /// Higher is more urgent.
    priority: i32,
    pipeline_id: Option<PipelineId>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    assigned_to: Option<AgentId>,
    retry_count: u32,
}

impl Task {
    /// Create an unassigned task stamped with the current time.
    pub fn new(task_type: TaskType, priority: i32, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            priority,
            pipeline_id: None,
            payload,
            created_at: Utc::now(),
            assigned_to: None,
            retry_count: 0,
        }
    }

    /// Attach the pipeline this task works on.
    pub fn for_pipeline(mut self, pipeline_id: PipelineId) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    /// Override the creation time, used when replaying ingested events.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn pipeline_id(&self) -> Option<&PipelineId> {
        self.pipeline_id.as_ref()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn assigned_to(&self) -> Option<&AgentId> {
        self.assigned_to.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_to.is_some()
    }

    /// Record the agent now holding this task.
    ///
    /// A task has at most one holder; assigning an already-held task fails.
    pub(crate) fn assign(&mut self, agent_id: AgentId) -> Result<()> {
        if let Some(current) = &self.assigned_to {
            return Err(Error::TaskAlreadyAssigned {
                task_id: self.id,
                agent_id: current.clone(),
            });
        }
        self.assigned_to = Some(agent_id);
        Ok(())
    }

    /// Clear the assignment, returning the previous holder.
    pub(crate) fn release(&mut self) -> Option<AgentId> {
        self.assigned_to.take()
    }

    /// Bump the retry count after a timed-out assignment.
    pub(crate) fn record_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }
}
