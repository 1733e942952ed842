//! Shared wiring for integration tests.
//!
//! [`Platform`] assembles an orchestrator, a pipeline controller and a
//! self-healer over one in-memory channel and store. Tests drive it step
//! by step and hand published events to the consumers with
//! [`Platform::deliver`], which is safe to repeat because every consumer
//! is idempotent on event id.

use std::sync::Arc;

use async_trait::async_trait;

use pipewright::agent::{Agent, AgentHandler, AgentId, AgentType};
use pipewright::catalog::SchemaChange;
use pipewright::channel::{topics, Event, EventHandler, InMemoryEventChannel, PlatformEvent};
use pipewright::config::Config;
use pipewright::core::{AgentDecision, Confidence, DecisionAction, Task};
use pipewright::healing::SelfHealer;
use pipewright::orchestration::{AgentRegistry, Orchestrator};
use pipewright::pipeline::PipelineController;
use pipewright::store::{MemoryStore, RetryPolicy};
use pipewright::Result;

pub struct Platform {
    pub store: Arc<MemoryStore>,
    pub channel: Arc<InMemoryEventChannel>,
    pub orchestrator: Arc<Orchestrator>,
    pub controller: Arc<PipelineController>,
    pub healer: Arc<SelfHealer>,
}

impl Platform {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(InMemoryEventChannel::new());
        let controller = Arc::new(PipelineController::new());
        let orchestrator = Orchestrator::new(
            &config,
            Arc::new(AgentRegistry::new()),
            store.clone(),
            channel.clone(),
        )
        .with_persistence(RetryPolicy::once());
        let healer = SelfHealer::new(config, store.clone(), channel.clone(), controller.clone())
            .expect("healer")
            .with_persistence(RetryPolicy::once());
        Self {
            store,
            channel,
            orchestrator: Arc::new(orchestrator),
            controller,
            healer: Arc::new(healer),
        }
    }

    /// Hand every event published so far on the coordination, mapping,
    /// control and pipeline-event topics to the healer and the controller.
    pub async fn deliver(&self) {
        for topic in [
            topics::COORDINATION,
            topics::MAPPING,
            topics::PIPELINE_CONTROL,
            topics::PIPELINE_EVENTS,
        ] {
            for event in self.channel.published(topic).await {
                self.healer.handle(&event).await.expect("healer");
                self.controller.handle(&event).await.expect("controller");
            }
        }
    }

    pub async fn events(&self, topic: &str) -> Vec<PlatformEvent> {
        self.channel
            .published(topic)
            .await
            .into_iter()
            .map(|e| e.body)
            .collect()
    }

    pub async fn add_agent(&self, agent: Agent, handler: Arc<dyn AgentHandler>) {
        self.orchestrator
            .register_agent(agent, handler)
            .await
            .expect("register agent");
    }
}

/// Answers every task with a fixed action and confidence.
pub struct FixedAgent {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub action: DecisionAction,
    pub confidence: f64,
}

impl FixedAgent {
    /// The registry entry and the handler for one agent.
    pub fn pair(
        id: &str,
        agent_type: AgentType,
        action: DecisionAction,
        confidence: f64,
        threshold: f64,
    ) -> (Agent, Arc<dyn AgentHandler>) {
        let agent = Agent::new(AgentId::from(id), agent_type, Confidence::clamped(threshold));
        let handler = Arc::new(FixedAgent {
            id: AgentId::from(id),
            agent_type,
            action,
            confidence,
        });
        (agent, handler)
    }
}

#[async_trait]
impl AgentHandler for FixedAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    async fn handle(&self, task: &Task) -> Result<AgentDecision> {
        AgentDecision::new(
            self.id.clone(),
            self.agent_type,
            task.id(),
            task.pipeline_id().cloned().unwrap_or_else(|| "none".into()),
            self.action.clone(),
            self.confidence,
            "fixed answer",
        )
    }
}

pub fn schema_changed(pipeline: &str, schema_version: u32) -> Event {
    Event::new(
        topics::SCHEMA,
        "discovery",
        PlatformEvent::SchemaChanged {
            pipeline_id: pipeline.into(),
            source_id: format!("{pipeline}-source"),
            schema_version,
            changes: Vec::<SchemaChange>::new(),
        },
    )
}

pub fn schedule_tick(pipeline: &str) -> Event {
    Event::new(
        topics::SCHEDULE,
        "scheduler",
        PlatformEvent::ScheduleTick {
            pipeline_id: pipeline.into(),
        },
    )
}
