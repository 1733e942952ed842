//! Core domain models for pipewright coordination.
//!
//! Tasks, agent decisions and pipelines are the records every other
//! component passes around. Each type is owned by exactly one component;
//! this module only defines their shape and local invariants.

pub mod decision;
pub mod pipeline;
pub mod task;

pub use decision::{AgentDecision, Confidence, DecisionAction, DecisionId, DecisionOutcome};
pub use pipeline::{
    ExecutionId, Pipeline, PipelineConfig, PipelineId, PipelineStatus, PipelineType,
};
pub use task::{Task, TaskId, TaskType};
