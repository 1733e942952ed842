use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentType;
use crate::core::{PipelineId, TaskType};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingPolicy,
    #[serde(default)]
    pub stream: StreamConfig,
    /// Per-pipeline overrides keyed by pipeline id.
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineOverrides>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Agents at or above this load receive no new tasks.
    pub max_agent_load: u32,
    pub agent_response_timeout_secs: u64,
    /// Timeouts tolerated per task before it is abandoned.
    pub max_task_retries: u32,
    /// Decisions further apart than this never conflict.
    pub coordination_window_ms: u64,
    pub persistence_retries: u32,
    pub persistence_backoff_ms: u64,
    pub task_priorities: TaskPriorities,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agent_load: 4,
            agent_response_timeout_secs: 30,
            max_task_retries: 3,
            coordination_window_ms: 5_000,
            persistence_retries: 5,
            persistence_backoff_ms: 100,
            task_priorities: TaskPriorities::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn agent_response_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_response_timeout_secs)
    }

    pub fn coordination_window(&self) -> Duration {
        Duration::from_millis(self.coordination_window_ms)
    }

    pub fn persistence_backoff(&self) -> Duration {
        Duration::from_millis(self.persistence_backoff_ms)
    }
}

/// Priority given to tasks created from ingested events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskPriorities {
    pub discovery: i32,
    pub mapping: i32,
    pub error_resolution: i32,
}

impl Default for TaskPriorities {
    fn default() -> Self {
        Self {
            discovery: 5,
            mapping: 10,
            error_resolution: 20,
        }
    }
}

impl TaskPriorities {
    pub fn for_type(&self, task_type: TaskType) -> i32 {
        match task_type {
            TaskType::Discovery => self.discovery,
            TaskType::Mapping => self.mapping,
            TaskType::ErrorResolution => self.error_resolution,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConflictConfig {
    #[serde(default)]
    pub priorities: PriorityTable,
}

/// Static agent-type priority used to break confidence ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriorityTable {
    pub error_resolution: u8,
    pub schema_mapping: u8,
    pub discovery: u8,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            error_resolution: 3,
            schema_mapping: 2,
            discovery: 1,
        }
    }
}

impl PriorityTable {
    pub fn priority(&self, agent_type: AgentType) -> u8 {
        match agent_type {
            AgentType::ErrorResolution => self.error_resolution,
            AgentType::SchemaMapping => self.schema_mapping,
            AgentType::Discovery => self.discovery,
        }
    }
}

/// Inclusive numeric range a setting may be adjusted within.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AdjustmentBound {
    pub min: f64,
    pub max: f64,
}

impl AdjustmentBound {
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Retry and remediation policy for pipeline errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorHandlingPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Settings the self-healing loop may change, with their bounds.
    pub allowed_adjustments: BTreeMap<String, AdjustmentBound>,
}

impl Default for ErrorHandlingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            allowed_adjustments: BTreeMap::new(),
        }
    }
}

impl ErrorHandlingPolicy {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn allow_adjustment(mut self, key: &str, min: f64, max: f64) -> Self {
        self.allowed_adjustments
            .insert(key.to_string(), AdjustmentBound { min, max });
        self
    }

    /// Reject a configuration delta unless every key is allow-listed and
    /// every value is a number within its bound.
    pub fn check_adjustment(&self, delta: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        if delta.is_empty() {
            return Err(Error::AdjustmentNotAllowed("empty adjustment".into()));
        }
        for (key, value) in delta {
            let bound = self
                .allowed_adjustments
                .get(key)
                .ok_or_else(|| Error::AdjustmentNotAllowed(format!("{key} is not allow-listed")))?;
            let number = value
                .as_f64()
                .ok_or_else(|| Error::AdjustmentNotAllowed(format!("{key} must be numeric")))?;
            if !bound.contains(number) {
                return Err(Error::AdjustmentNotAllowed(format!(
                    "{key}={number} outside [{}, {}]",
                    bound.min, bound.max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PipelineOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandlingPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Destination ack latency above which consumption pauses.
    pub backpressure_threshold_ms: u64,
    /// How often a paused stream re-checks destination latency.
    pub probe_interval_ms: u64,
    pub max_batch: usize,
    /// Produce attempts per record before the run is failed.
    pub transport_retries: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold_ms: 500,
            probe_interval_ms: 50,
            max_batch: 100,
            transport_retries: 3,
        }
    }
}

impl StreamConfig {
    pub fn backpressure_threshold(&self) -> Duration {
        Duration::from_millis(self.backpressure_threshold_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub agent_type: AgentType,
    #[serde(default)]
    pub capabilities: Vec<TaskType>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    0.8
}

impl Config {
    pub fn pipewright_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".pipewright"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::pipewright_dir()?.join("pipewright.toml"))
    }

    /// Directory used by the file-backed metadata store.
    pub fn store_dir() -> Result<PathBuf> {
        Ok(Self::pipewright_dir()?.join("store"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            agents = config.agents.len(),
            pipelines = config.pipelines.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Effective error-handling policy for a pipeline.
    pub fn policy_for(&self, pipeline_id: &PipelineId) -> ErrorHandlingPolicy {
        self.pipelines
            .get(pipeline_id.as_str())
            .and_then(|p| p.error_handling.clone())
            .unwrap_or_else(|| self.error_handling.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_agent_load == 0 {
            return Err(Error::Validation(
                "orchestrator.max_agent_load must be at least 1".into(),
            ));
        }
        if self.stream.max_batch == 0 {
            return Err(Error::Validation("stream.max_batch must be at least 1".into()));
        }
        for agent in &self.agents {
            if !(0.0..=1.0).contains(&agent.confidence_threshold) {
                return Err(Error::Validation(format!(
                    "agent {} confidence_threshold {} is outside [0, 1]",
                    agent.id.as_deref().unwrap_or("<generated>"),
                    agent.confidence_threshold
                )));
            }
        }
        validate_policy("error_handling", &self.error_handling)?;
        for (id, overrides) in &self.pipelines {
            if let Some(policy) = &overrides.error_handling {
                validate_policy(&format!("pipelines.{id}.error_handling"), policy)?;
            }
        }
        Ok(())
    }
}

fn validate_policy(name: &str, policy: &ErrorHandlingPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        return Err(Error::Validation(format!("{name}.max_attempts must be at least 1")));
    }
    if policy.base_backoff_ms > policy.max_backoff_ms {
        return Err(Error::Validation(format!(
            "{name}.base_backoff_ms exceeds max_backoff_ms"
        )));
    }
    for (key, bound) in &policy.allowed_adjustments {
        if bound.min > bound.max {
            return Err(Error::Validation(format!(
                "{name}.allowed_adjustments.{key} has min greater than max"
            )));
        }
    }
    Ok(())
}
