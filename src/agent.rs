use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::core::{AgentDecision, Confidence, Task, TaskType};
use crate::Result;

/// Identifier of an agent instance, e.g. `discovery-1a2b3c4d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Generate an id prefixed with the agent type.
    pub fn generate(agent_type: AgentType) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", agent_type, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Discovery,
    SchemaMapping,
    ErrorResolution,
}

impl AgentType {
    /// Task types an agent of this type accepts when none are configured.
    pub fn default_capabilities(&self) -> BTreeSet<TaskType> {
        match self {
            AgentType::Discovery => BTreeSet::from([TaskType::Discovery]),
            AgentType::SchemaMapping => BTreeSet::from([TaskType::Mapping]),
            AgentType::ErrorResolution => BTreeSet::from([TaskType::ErrorResolution]),
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Discovery => write!(f, "discovery"),
            AgentType::SchemaMapping => write!(f, "schema_mapping"),
            AgentType::ErrorResolution => write!(f, "error_resolution"),
        }
    }
}

/// Registry entry for an agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub capabilities: BTreeSet<TaskType>,
    /// Decisions below this confidence wait for human review.
    pub confidence_threshold: Confidence,
    pub current_load: u32,
}

impl Agent {
    pub fn new(id: AgentId, agent_type: AgentType, confidence_threshold: Confidence) -> Self {
        Self {
            id,
            agent_type,
            capabilities: agent_type.default_capabilities(),
            confidence_threshold,
            current_load: 0,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let id = config
            .id
            .as_deref()
            .map(AgentId::from)
            .unwrap_or_else(|| AgentId::generate(config.agent_type));
        let capabilities = if config.capabilities.is_empty() {
            config.agent_type.default_capabilities()
        } else {
            config.capabilities.iter().copied().collect()
        };
        Ok(Self {
            id,
            agent_type: config.agent_type,
            capabilities,
            confidence_threshold: Confidence::new(config.confidence_threshold)?,
            current_load: 0,
        })
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = TaskType>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn accepts(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&task_type)
    }

    /// Whether a decision may be applied without human review.
    pub fn trusts(&self, confidence: Confidence) -> bool {
        confidence >= self.confidence_threshold
    }
}

/// An autonomous agent implementation.
///
/// The core never looks at how confidence or reasoning are produced; it
/// only receives the finished decision.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    fn id(&self) -> &AgentId;

    async fn handle(&self, task: &Task) -> Result<AgentDecision>;
}
