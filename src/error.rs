use thiserror::Error;

use crate::agent::AgentId;
use crate::core::{PipelineId, TaskId, TaskType};
use crate::healing::ErrorId;
use crate::pipeline::Record;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No eligible agent for task type {0}")]
    NoEligibleAgent(TaskType),

    #[error("All eligible agents for {task_type} are at capacity (max load: {max_load})")]
    CapacityExceeded { task_type: TaskType, max_load: u32 },

    #[error("Validation failure: {0}")]
    ValidationFailure(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Structural failure: {0}")]
    StructuralFailure(String),

    #[error("Record rejected by the destination: {reason}")]
    RecordRejected { reason: String, record: Record },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Confidence {0} is outside [0, 1]")]
    InvalidConfidence(f64),

    #[error("Invalid pipeline transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: AgentId },

    #[error("Agent already registered: {id}")]
    AgentAlreadyRegistered { id: AgentId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task_id} is already assigned to {agent_id}")]
    TaskAlreadyAssigned { task_id: TaskId, agent_id: AgentId },

    #[error("Task {0} already has an active decision")]
    DecisionAlreadyActive(TaskId),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("Pipeline error not found: {0}")]
    ErrorNotFound(ErrorId),

    #[error("Pipeline error {0} was escalated and will not be retried")]
    AlreadyEscalated(ErrorId),

    #[error("Configuration adjustment not allowed: {0}")]
    AdjustmentNotAllowed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Event channel closed: {0}")]
    ChannelClosed(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Infrastructure failures that are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PersistenceFailure(_) | Error::TransportFailure(_) | Error::Timeout(_)
        )
    }

    /// Failures that abort a pipeline run instead of a single record.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::StructuralFailure(_) | Error::RecordRejected { .. } | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
