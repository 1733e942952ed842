//! Agent decisions and the confidence scores that gate them.
//!
//! An `AgentDecision` is an audit record. Agents write it once; the
//! orchestrator never edits it in place but appends a terminal copy that
//! carries the outcome (applied, deferred, superseded, ...).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentId, AgentType};
use crate::core::{PipelineId, TaskId};
use crate::error::{Error, Result};

/// Unique identifier for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionId(pub Uuid);

impl DecisionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DecisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A confidence score guaranteed to lie within [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    pub const MIN: Confidence = Confidence(0.0);
    pub const MAX: Confidence = Confidence(1.0);

    /// Validate a score, rejecting NaN and anything outside [0, 1].
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(Error::InvalidConfidence(value));
        }
        Ok(Self(value))
    }

    /// Clamp a computed score into [0, 1]. NaN maps to 0.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self::MIN;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> f64 {
        c.0
    }
}

// Values are never NaN, so the ordering is total.
impl Eq for Confidence {}

impl Ord for Confidence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Action an agent proposes for a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum DecisionAction {
    /// Record discovery output in the catalog.
    UpdateCatalog,
    /// Switch the pipeline to mappings built for a schema version.
    UpdateMapping { schema_version: u32 },
    PausePipeline,
    ResumePipeline,
    Retry,
    Skip,
    AdjustConfig {
        delta: BTreeMap<String, serde_json::Value>,
    },
    Escalate,
}

impl DecisionAction {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionAction::UpdateCatalog => "update_catalog",
            DecisionAction::UpdateMapping { .. } => "update_mapping",
            DecisionAction::PausePipeline => "pause_pipeline",
            DecisionAction::ResumePipeline => "resume_pipeline",
            DecisionAction::Retry => "retry",
            DecisionAction::Skip => "skip",
            DecisionAction::AdjustConfig { .. } => "adjust_config",
            DecisionAction::Escalate => "escalate",
        }
    }

    /// Actions that steer the pipeline's execution.
    pub fn is_control(&self) -> bool {
        !matches!(
            self,
            DecisionAction::UpdateCatalog | DecisionAction::UpdateMapping { .. }
        )
    }

    /// Whether applying both actions to one pipeline is contradictory.
    ///
    /// Any two different control actions conflict. Metadata actions only
    /// conflict with the same kind of action carrying a different payload.
    pub fn conflicts_with(&self, other: &DecisionAction) -> bool {
        if self == other {
            return false;
        }
        match (self, other) {
            (a, b) if a.is_control() && b.is_control() => true,
            (DecisionAction::UpdateMapping { .. }, DecisionAction::UpdateMapping { .. }) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Terminal outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Applied automatically.
    Applied,
    /// Confidence below the agent's threshold; waiting for a human.
    Deferred,
    /// Lost conflict arbitration.
    Superseded,
    /// The task was abandoned before the decision could be applied.
    Abandoned,
}

impl std::fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionOutcome::Applied => write!(f, "applied"),
            DecisionOutcome::Deferred => write!(f, "deferred"),
            DecisionOutcome::Superseded => write!(f, "superseded"),
            DecisionOutcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Audit record of an agent's proposed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDecision {
    pub id: DecisionId,
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub task_id: TaskId,
    /// The pipeline resource the action targets.
    pub pipeline_id: PipelineId,
    pub action: DecisionAction,
    pub confidence: Confidence,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Option<DecisionOutcome>,
}

impl AgentDecision {
    /// Create a pending decision.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfidence` when `confidence` is outside [0, 1].
    pub fn new(
        agent_id: AgentId,
        agent_type: AgentType,
        task_id: TaskId,
        pipeline_id: PipelineId,
        action: DecisionAction,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: DecisionId::new(),
            agent_id,
            agent_type,
            task_id,
            pipeline_id,
            action,
            confidence: Confidence::new(confidence)?,
            reasoning: reasoning.into(),
            timestamp: Utc::now(),
            outcome: None,
        })
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Produce the terminal copy of this decision.
    pub fn with_outcome(&self, outcome: DecisionOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}
