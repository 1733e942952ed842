//! Event envelope and the closed set of typed platform events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::catalog::SchemaChange;
use crate::core::{AgentDecision, DecisionId, ExecutionId, PipelineId, TaskId, TaskType};
use crate::healing::{PipelineError, Resolution};
use crate::orchestration::ResolutionRule;
use crate::pipeline::ExecutionMetrics;
use crate::Result;

/// Unique event identifier; the idempotency key for every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle command addressed to the engine owning a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineCommand {
    Pause,
    Resume,
    Stop,
}

/// Everything that travels over the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PlatformEvent {
    ScheduleTick {
        pipeline_id: PipelineId,
    },
    SourceChanged {
        pipeline_id: PipelineId,
        source_id: String,
    },
    SchemaChanged {
        pipeline_id: PipelineId,
        source_id: String,
        schema_version: u32,
        changes: Vec<SchemaChange>,
    },
    TaskAssigned {
        task_id: TaskId,
        task_type: TaskType,
        agent_id: AgentId,
    },
    TaskAbandoned {
        task_id: TaskId,
        task_type: TaskType,
        retries: u32,
    },
    DecisionApplied {
        decision: AgentDecision,
    },
    DecisionDeferred {
        decision: AgentDecision,
    },
    ConflictResolved {
        pipeline_id: PipelineId,
        winner: DecisionId,
        loser: DecisionId,
        rule: ResolutionRule,
    },
    CatalogUpdated {
        pipeline_id: PipelineId,
    },
    MappingUpdated {
        pipeline_id: PipelineId,
        schema_version: u32,
    },
    PipelineControl {
        pipeline_id: PipelineId,
        command: PipelineCommand,
    },
    PipelineFailed {
        error: PipelineError,
    },
    ExecutionCompleted {
        pipeline_id: PipelineId,
        execution_id: ExecutionId,
        metrics: ExecutionMetrics,
    },
    ErrorResolved {
        resolution: Resolution,
    },
    ErrorEscalated {
        resolution: Resolution,
    },
}

impl PlatformEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PlatformEvent::ScheduleTick { .. } => "schedule_tick",
            PlatformEvent::SourceChanged { .. } => "source_changed",
            PlatformEvent::SchemaChanged { .. } => "schema_changed",
            PlatformEvent::TaskAssigned { .. } => "task_assigned",
            PlatformEvent::TaskAbandoned { .. } => "task_abandoned",
            PlatformEvent::DecisionApplied { .. } => "decision_applied",
            PlatformEvent::DecisionDeferred { .. } => "decision_deferred",
            PlatformEvent::ConflictResolved { .. } => "conflict_resolved",
            PlatformEvent::CatalogUpdated { .. } => "catalog_updated",
            PlatformEvent::MappingUpdated { .. } => "mapping_updated",
            PlatformEvent::PipelineControl { .. } => "pipeline_control",
            PlatformEvent::PipelineFailed { .. } => "pipeline_failed",
            PlatformEvent::ExecutionCompleted { .. } => "execution_completed",
            PlatformEvent::ErrorResolved { .. } => "error_resolved",
            PlatformEvent::ErrorEscalated { .. } => "error_escalated",
        }
    }

    /// The pipeline this event concerns, if any.
    pub fn pipeline_id(&self) -> Option<&PipelineId> {
        match self {
            PlatformEvent::ScheduleTick { pipeline_id }
            | PlatformEvent::SourceChanged { pipeline_id, .. }
            | PlatformEvent::SchemaChanged { pipeline_id, .. }
            | PlatformEvent::ConflictResolved { pipeline_id, .. }
            | PlatformEvent::CatalogUpdated { pipeline_id }
            | PlatformEvent::MappingUpdated { pipeline_id, .. }
            | PlatformEvent::PipelineControl { pipeline_id, .. }
            | PlatformEvent::ExecutionCompleted { pipeline_id, .. } => Some(pipeline_id),
            PlatformEvent::DecisionApplied { decision }
            | PlatformEvent::DecisionDeferred { decision } => Some(&decision.pipeline_id),
            PlatformEvent::PipelineFailed { error } => Some(&error.pipeline_id),
            PlatformEvent::ErrorResolved { resolution }
            | PlatformEvent::ErrorEscalated { resolution } => Some(&resolution.pipeline_id),
            PlatformEvent::TaskAssigned { .. } | PlatformEvent::TaskAbandoned { .. } => None,
        }
    }
}

/// Envelope published on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic: String,
    pub body: PlatformEvent,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    pub source: String,
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(topic: impl Into<String>, source: impl Into<String>, body: PlatformEvent) -> Self {
        Self {
            id: EventId::new(),
            topic: topic.into(),
            body,
            timestamp: Utc::now(),
            source: source.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
