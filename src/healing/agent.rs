use std::sync::Arc;

use async_trait::async_trait;

use super::healer::{action_for, SelfHealer};
use super::types::PipelineError;
use crate::agent::{AgentHandler, AgentId, AgentType};
use crate::core::{AgentDecision, Task, TaskType};
use crate::{Error, Result};

/// Error-resolution agent backed by the self-healing loop.
///
/// Proposes the diagnosed strategy as a decision. The strategy runs once
/// the orchestrator applies the decision and the healer sees
/// `DecisionApplied` for the linked task.
pub struct HealingAgent {
    id: AgentId,
    healer: Arc<SelfHealer>,
}

impl HealingAgent {
    pub fn new(id: AgentId, healer: Arc<SelfHealer>) -> Self {
        Self { id, healer }
    }
}

#[async_trait]
impl AgentHandler for HealingAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    async fn handle(&self, task: &Task) -> Result<AgentDecision> {
        if task.task_type() != TaskType::ErrorResolution {
            return Err(Error::Validation(format!(
                "{} cannot handle {} tasks",
                self.id,
                task.task_type()
            )));
        }
        let error: PipelineError = serde_json::from_value(task.payload().clone())?;
        let pipeline_id = error.pipeline_id.clone();
        let error_id = self.healer.capture(error).await?;
        let diagnosis = self.healer.diagnose_error(&error_id).await?;
        self.healer.link_task(task.id(), error_id).await;

        let reasoning = if diagnosis.supporting > 0 {
            format!(
                "{} errors on this pipeline type were resolved by {} {} time(s)",
                diagnosis.error_type, diagnosis.candidate, diagnosis.supporting
            )
        } else {
            format!("no prior resolution for {} errors, defaulting to retry", diagnosis.error_type)
        };

        AgentDecision::new(
            self.id.clone(),
            AgentType::ErrorResolution,
            task.id(),
            pipeline_id,
            action_for(&diagnosis),
            diagnosis.confidence.value(),
            reasoning,
        )
    }
}
