//! Agent registry.
//!
//! The registry owns every agent's live load counter. Each call runs inside
//! a single critical section, so selecting the least-loaded agent and
//! bumping its load can never interleave with another assignment.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::debug;

use crate::agent::{Agent, AgentId, AgentType};
use crate::config::Config;
use crate::core::TaskType;
use crate::{Error, Result};

/// Tracks registered agents, their capabilities and current load.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Mutex<BTreeMap<AgentId, Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the `[[agents]]` configuration section.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new();
        for agent_config in &config.agents {
            registry.register(Agent::from_config(agent_config)?).await?;
        }
        Ok(registry)
    }

    /// Add an agent. Its load starts at zero whatever the caller passed.
    pub async fn register(&self, mut agent: Agent) -> Result<()> {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(&agent.id) {
            return Err(Error::AgentAlreadyRegistered { id: agent.id });
        }
        debug!(agent = %agent.id, agent_type = %agent.agent_type, "agent registered");
        agent.current_load = 0;
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    pub async fn deregister(&self, id: &AgentId) -> Result<Agent> {
        self.agents
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })
    }

    pub async fn get(&self, id: &AgentId) -> Option<Agent> {
        self.agents.lock().await.get(id).cloned()
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.agents.lock().await.values().cloned().collect()
    }

    /// Agents declaring `task_type`, ordered by ascending load then id.
    ///
    /// # Errors
    ///
    /// `NoEligibleAgent` when no registered agent declares the capability.
    pub async fn capacity_for(&self, task_type: TaskType) -> Result<Vec<Agent>> {
        let agents = self.agents.lock().await;
        let eligible = eligible(&agents, task_type, None);
        if eligible.is_empty() {
            return Err(Error::NoEligibleAgent(task_type));
        }
        Ok(eligible.into_iter().cloned().collect())
    }

    /// Pick the least-loaded eligible agent below `max_load` and count the
    /// assignment, atomically.
    ///
    /// `agent_type` narrows the candidates to one agent type.
    ///
    /// # Errors
    ///
    /// `NoEligibleAgent` when nothing declares the capability,
    /// `CapacityExceeded` when every eligible agent is at `max_load`.
    pub async fn reserve(
        &self,
        task_type: TaskType,
        agent_type: Option<AgentType>,
        max_load: u32,
    ) -> Result<Agent> {
        let mut agents = self.agents.lock().await;
        let chosen = {
            let candidates = eligible(&agents, task_type, agent_type);
            if candidates.is_empty() {
                return Err(Error::NoEligibleAgent(task_type));
            }
            candidates
                .into_iter()
                .find(|a| a.current_load < max_load)
                .map(|a| a.id.clone())
                .ok_or(Error::CapacityExceeded {
                    task_type,
                    max_load,
                })?
        };
        let agent = agents
            .get_mut(&chosen)
            .ok_or_else(|| Error::AgentNotFound { id: chosen.clone() })?;
        agent.current_load += 1;
        Ok(agent.clone())
    }

    /// Count one more task held by `id`. Returns the new load.
    pub async fn record_assignment(&self, id: &AgentId) -> Result<u32> {
        let mut agents = self.agents.lock().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })?;
        agent.current_load += 1;
        Ok(agent.current_load)
    }

    /// Count one task released by `id`. Never drops below zero.
    pub async fn record_completion(&self, id: &AgentId) -> Result<u32> {
        let mut agents = self.agents.lock().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })?;
        agent.current_load = agent.current_load.saturating_sub(1);
        Ok(agent.current_load)
    }
}

fn eligible<'a>(
    agents: &'a BTreeMap<AgentId, Agent>,
    task_type: TaskType,
    agent_type: Option<AgentType>,
) -> Vec<&'a Agent> {
    let mut found: Vec<&Agent> = agents
        .values()
        .filter(|a| a.accepts(task_type))
        .filter(|a| agent_type.map_or(true, |wanted| wanted == a.agent_type))
        .collect();
    found.sort_by(|a, b| a.current_load.cmp(&b.current_load).then_with(|| a.id.cmp(&b.id)));
    found
}
