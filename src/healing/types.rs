use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Confidence, ExecutionId, PipelineId, PipelineType};
use crate::Error;

/// Unique identifier for a captured pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorId(pub Uuid);

impl ErrorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ErrorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ErrorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Connection,
    Timeout,
    Schema,
    Validation,
    Resource,
    Permission,
    Unknown,
}

/// Checked in order; the first match wins.
static CLASSIFIERS: LazyLock<Vec<(ErrorType, Regex)>> = LazyLock::new(|| {
    [
        (ErrorType::Permission, r"(?i)permission denied|unauthori[sz]ed|forbidden|access denied"),
        (ErrorType::Timeout, r"(?i)timed? ?out|deadline exceeded"),
        (
            ErrorType::Connection,
            r"(?i)connection (refused|reset|lost|closed)|broken pipe|unreachable|disconnected",
        ),
        (
            ErrorType::Schema,
            r"(?i)schema|unknown (column|field)|missing (column|field)|column .* does not exist",
        ),
        (ErrorType::Resource, r"(?i)out of memory|disk full|quota|rate limit|too many"),
        (ErrorType::Validation, r"(?i)invalid|validation|cannot (parse|convert)|type mismatch"),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
    .collect()
});

impl ErrorType {
    /// Classify a free-form error message.
    pub fn classify(message: &str) -> Self {
        CLASSIFIERS
            .iter()
            .find(|(_, re)| re.is_match(message))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorType::Unknown)
    }

    /// Classify a crate error raised by an engine.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Timeout(_) => ErrorType::Timeout,
            Error::ValidationFailure(_) | Error::RecordRejected { .. } => ErrorType::Validation,
            Error::StructuralFailure(msg) | Error::TransportFailure(msg) => {
                match Self::classify(msg) {
                    ErrorType::Unknown => ErrorType::Connection,
                    kind => kind,
                }
            }
            other => Self::classify(&other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorType::Connection => "connection",
            ErrorType::Timeout => "timeout",
            ErrorType::Schema => "schema",
            ErrorType::Validation => "validation",
            ErrorType::Resource => "resource",
            ErrorType::Permission => "permission",
            ErrorType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A failure raised by a pipeline engine, owned by the self-healing loop
/// until it reaches a terminal `Resolution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub id: ErrorId,
    pub pipeline_id: PipelineId,
    pub pipeline_type: PipelineType,
    pub execution_id: ExecutionId,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl PipelineError {
    pub fn new(
        pipeline_id: PipelineId,
        pipeline_type: PipelineType,
        execution_id: ExecutionId,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            id: ErrorId::new(),
            pipeline_id,
            pipeline_type,
            execution_id,
            error_type: ErrorType::classify(&message),
            message,
            context: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(
        pipeline_id: PipelineId,
        pipeline_type: PipelineType,
        execution_id: ExecutionId,
        error: &Error,
    ) -> Self {
        let failure = Self {
            error_type: ErrorType::from_error(error),
            ..Self::new(pipeline_id, pipeline_type, execution_id, error.to_string())
        };
        match error {
            Error::RecordRejected { record, .. } => {
                failure.with_context("record", serde_json::json!(record))
            }
            _ => failure,
        }
    }

    pub fn with_error_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Per-error lifecycle of the self-healing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingState {
    Captured,
    Diagnosing,
    Resolving,
    Resolved,
    Escalated,
}

impl HealingState {
    pub fn can_transition_to(&self, next: HealingState) -> bool {
        matches!(
            (self, next),
            (HealingState::Captured, HealingState::Diagnosing)
                | (HealingState::Diagnosing, HealingState::Resolving)
                | (HealingState::Diagnosing, HealingState::Escalated)
                | (HealingState::Resolving, HealingState::Resolved)
                | (HealingState::Resolving, HealingState::Escalated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HealingState::Resolved | HealingState::Escalated)
    }
}

impl std::fmt::Display for HealingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealingState::Captured => "captured",
            HealingState::Diagnosing => "diagnosing",
            HealingState::Resolving => "resolving",
            HealingState::Resolved => "resolved",
            HealingState::Escalated => "escalated",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Retry,
    /// Discard the offending record and resume.
    Skip,
    /// Apply an allow-listed configuration delta and resume.
    AdjustConfig,
    Escalate,
}

impl Strategy {
    /// Strategies whose success lets a failed pipeline run again.
    pub fn resumes_pipeline(&self) -> bool {
        !matches!(self, Strategy::Escalate)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::Retry => "retry",
            Strategy::Skip => "skip",
            Strategy::AdjustConfig => "adjust_config",
            Strategy::Escalate => "escalate",
        };
        write!(f, "{s}")
    }
}

/// Configuration changes proposed or applied by `adjust_config`.
pub type ConfigDelta = BTreeMap<String, serde_json::Value>;

/// Outcome of `diagnose_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub error_id: ErrorId,
    pub error_type: ErrorType,
    pub candidate: Strategy,
    /// Delta to apply when the candidate is `adjust_config`.
    pub delta: Option<ConfigDelta>,
    /// Number of prior successful resolutions backing the candidate.
    pub supporting: usize,
    pub confidence: Confidence,
}

/// Terminal record for a `PipelineError`, successful or escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub error_id: ErrorId,
    pub pipeline_id: PipelineId,
    pub pipeline_type: PipelineType,
    pub error_type: ErrorType,
    pub strategy: Strategy,
    /// Human-readable log of what was attempted.
    pub actions: Vec<String>,
    pub success: bool,
    pub attempts: u32,
    #[serde(default)]
    pub delta: Option<ConfigDelta>,
    pub applied_at: DateTime<Utc>,
    /// Diagnostic context carried for the operator on escalation.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Resolution {
    pub fn is_escalated(&self) -> bool {
        self.strategy == Strategy::Escalate
    }

    /// Whether this resolution allows `failed -> running`.
    pub fn permits_resume(&self) -> bool {
        self.success && self.strategy.resumes_pipeline()
    }
}
