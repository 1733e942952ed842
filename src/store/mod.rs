//! Metadata store contract.
//!
//! [`MetadataStore`] is synchronous request/response. Every failure is
//! reported as `Error::PersistenceFailure` so callers can retry it with
//! [`persist_with_retry`] and must never drop it.

mod file;
mod memory;
mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::catalog::{CatalogEntry, CatalogQuery, Schema};
use crate::channel::EventId;
use crate::core::{AgentDecision, DecisionId, PipelineId, TaskId, TaskType};
use crate::healing::{ErrorId, Resolution};
use crate::orchestration::ResolutionRule;
use crate::Result;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use retry::{persist_with_retry, RetryPolicy};

/// One append-only entry of the coordination log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum CoordinationEntry {
    TaskAssigned {
        task_id: TaskId,
        task_type: TaskType,
        agent_id: AgentId,
    },
    TaskRequeued {
        task_id: TaskId,
        agent_id: AgentId,
        retry_count: u32,
        reason: String,
    },
    TaskAbandoned {
        task_id: TaskId,
        task_type: TaskType,
        retries: u32,
    },
    DecisionApplied {
        decision_id: DecisionId,
        task_id: TaskId,
    },
    DecisionDeferred {
        decision_id: DecisionId,
        task_id: TaskId,
    },
    ConflictResolved {
        pipeline_id: PipelineId,
        winner: DecisionId,
        loser: DecisionId,
        rule: ResolutionRule,
    },
    Notified {
        event_id: EventId,
        topic: String,
        event_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: CoordinationEntry,
}

impl CoordinationRecord {
    pub fn now(entry: CoordinationEntry) -> Self {
        Self {
            timestamp: Utc::now(),
            entry,
        }
    }
}

/// Storage contract for decisions, coordination log, catalog, schema
/// history and self-healing state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn MetadataStore>`.
pub trait MetadataStore: Send + Sync {
    /// Append a decision record. Terminal copies are appended, never replaced.
    fn save_agent_decision(&self, decision: &AgentDecision) -> Result<()>;

    /// Every stored record for a task, oldest first.
    fn decisions_for_task(&self, task_id: &TaskId) -> Result<Vec<AgentDecision>>;

    fn append_coordination_log(&self, record: &CoordinationRecord) -> Result<()>;

    fn coordination_log(&self) -> Result<Vec<CoordinationRecord>>;

    /// Upsert keyed by `source_id`.
    fn save_catalog_entry(&self, entry: &CatalogEntry) -> Result<()>;

    fn query_catalog(&self, query: &CatalogQuery) -> Result<Vec<CatalogEntry>>;

    fn save_schema_version(&self, schema: &Schema) -> Result<()>;

    /// Schema versions of a source, ascending by version.
    fn get_schema_history(&self, source_id: &str) -> Result<Vec<Schema>>;

    fn save_resolution(&self, resolution: &Resolution) -> Result<()>;

    fn load_resolutions(&self) -> Result<Vec<Resolution>>;

    /// Persist the retry attempt counter of a pipeline error.
    fn save_attempts(&self, error_id: &ErrorId, attempts: u32) -> Result<()>;

    fn load_attempts(&self, error_id: &ErrorId) -> Result<Option<u32>>;
}
