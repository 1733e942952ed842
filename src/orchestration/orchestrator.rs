//! The orchestrator: event ingestion, task assignment, decision gating and
//! conflict resolution.
//!
//! Every coordination step is written to the metadata store before the
//! event announcing it is published, so a crash can lose a notification but
//! never publish something that was not recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::plan::CoordinationPlan;
use super::queue::TaskQueue;
use super::registry::AgentRegistry;
use super::resolver::{AgentConflict, ConflictResolution, ConflictResolver};
use crate::actors::ActorHandle;
use crate::agent::{Agent, AgentHandler, AgentId, AgentType};
use crate::channel::{
    self, topics, Event, EventChannel, EventHandler, PipelineCommand, PlatformEvent,
    ProcessedEvents,
};
use crate::config::{Config, OrchestratorConfig, TaskPriorities};
use crate::core::{
    AgentDecision, DecisionAction, DecisionId, DecisionOutcome, PipelineId, Task, TaskId,
    TaskType,
};
use crate::store::{
    persist_with_retry, CoordinationEntry, CoordinationRecord, MetadataStore, RetryPolicy,
};
use crate::util::with_timeout;
use crate::{Error, Result};

const SOURCE: &str = "orchestrator";

/// A task handed to an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
}

/// What happened to an assignment once the agent was run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The agent answered and its decision is buffered for the next cycle.
    Decided(DecisionId),
    /// The agent failed or timed out; the task is back in the queue.
    Requeued { retry_count: u32 },
    /// The task exceeded its retry allowance and was dropped.
    Abandoned { retries: u32 },
}

/// Outcome of one coordination cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub applied: Vec<DecisionId>,
    pub deferred: Vec<DecisionId>,
    pub superseded: Vec<ConflictResolution>,
    /// Decisions whose outcome could not be persisted. Accepted ones stay
    /// buffered; superseded ones only have their conflict record retried.
    pub failed: Vec<DecisionId>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
            && self.deferred.is_empty()
            && self.superseded.is_empty()
            && self.failed.is_empty()
    }
}

/// Central coordinator of agents, tasks and decisions.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    resolver: ConflictResolver,
    store: Arc<dyn MetadataStore>,
    channel: Arc<dyn EventChannel>,
    persistence: RetryPolicy,
    handlers: RwLock<HashMap<AgentId, Arc<dyn AgentHandler>>>,
    in_flight: Mutex<HashMap<TaskId, Task>>,
    pending: Mutex<HashMap<TaskId, AgentDecision>>,
    /// Superseded decisions whose conflict record is not yet persisted.
    unrecorded: Mutex<Vec<ConflictResolution>>,
    /// Notifications for recorded outcomes that could not be published yet.
    outbox: Mutex<VecDeque<Event>>,
    processed: Mutex<ProcessedEvents>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        registry: Arc<AgentRegistry>,
        store: Arc<dyn MetadataStore>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            config: config.orchestrator.clone(),
            registry,
            queue: Arc::new(TaskQueue::new()),
            resolver: ConflictResolver::new(
                config.conflict.priorities.clone(),
                config.orchestrator.coordination_window(),
            ),
            store,
            channel,
            persistence: RetryPolicy::from_config(&config.orchestrator),
            handlers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            unrecorded: Mutex::new(Vec::new()),
            outbox: Mutex::new(VecDeque::new()),
            processed: Mutex::new(ProcessedEvents::new()),
        }
    }

    pub fn with_persistence(mut self, policy: RetryPolicy) -> Self {
        self.persistence = policy;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Register an agent together with the implementation that runs it.
    pub async fn register_agent(&self, agent: Agent, handler: Arc<dyn AgentHandler>) -> Result<()> {
        if handler.id() != &agent.id {
            return Err(Error::Validation(format!(
                "handler {} does not implement agent {}",
                handler.id(),
                agent.id
            )));
        }
        let id = agent.id.clone();
        self.registry.register(agent).await?;
        self.handlers.write().await.insert(id, handler);
        Ok(())
    }

    /// Attach a handler to an agent that is already in the registry.
    pub async fn attach_handler(&self, handler: Arc<dyn AgentHandler>) -> Result<()> {
        let id = handler.id().clone();
        if self.registry.get(&id).await.is_none() {
            return Err(Error::AgentNotFound { id });
        }
        self.handlers.write().await.insert(id, handler);
        Ok(())
    }

    /// Turn an inbound event into a queued task.
    ///
    /// Redelivered events are ignored, so ingesting the same event twice
    /// creates one task. Events that map to no work return `None`.
    pub async fn ingest(&self, event: &Event) -> Result<Option<TaskId>> {
        if !self.processed.lock().await.first_delivery(event.id) {
            debug!(event_id = %event.id, "duplicate delivery ignored");
            return Ok(None);
        }

        let Some(task) = task_for_event(event, &self.config.task_priorities)? else {
            return Ok(None);
        };
        let task_id = task.id();
        info!(
            task_id = %task_id.short(),
            task_type = %task.task_type(),
            event_type = event.body.event_type(),
            "task created from event"
        );
        self.queue.enqueue(task).await;
        Ok(Some(task_id))
    }

    /// Assign `task` to the least-loaded eligible agent.
    ///
    /// `agent_type` narrows the choice to one agent type. The registry
    /// reservation and the log entry both succeed, or the reservation is
    /// rolled back and the error returned to the caller, who still owns the
    /// task.
    pub async fn assign_task(
        &self,
        task: &Task,
        agent_type: Option<AgentType>,
    ) -> Result<TaskAssignment> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(held) = in_flight.get(&task.id()) {
                return Err(Error::TaskAlreadyAssigned {
                    task_id: task.id(),
                    agent_id: held
                        .assigned_to()
                        .cloned()
                        .unwrap_or_else(|| AgentId::from("pending")),
                });
            }
            // Claim the id so a concurrent call cannot assign it too.
            in_flight.insert(task.id(), task.clone());
        }

        match self.reserve_and_record(task, agent_type).await {
            Ok((held, assignment)) => {
                self.in_flight.lock().await.insert(held.id(), held);
                // The assignment is durable at this point; a lost
                // notification must not undo it.
                let notified = self
                    .notify_agents(Event::new(
                        topics::COORDINATION,
                        SOURCE,
                        PlatformEvent::TaskAssigned {
                            task_id: assignment.task_id,
                            task_type: assignment.task_type,
                            agent_id: assignment.agent_id.clone(),
                        },
                    ))
                    .await;
                if let Err(e) = notified {
                    warn!(task_id = %assignment.task_id.short(), error = %e, "assignment not announced");
                }
                Ok(assignment)
            }
            Err(e) => {
                self.in_flight.lock().await.remove(&task.id());
                Err(e)
            }
        }
    }

    async fn reserve_and_record(
        &self,
        task: &Task,
        agent_type: Option<AgentType>,
    ) -> Result<(Task, TaskAssignment)> {
        let agent = self
            .registry
            .reserve(task.task_type(), agent_type, self.config.max_agent_load)
            .await?;

        let mut held = task.clone();
        held.assign(agent.id.clone())?;
        let record = CoordinationRecord::now(CoordinationEntry::TaskAssigned {
            task_id: task.id(),
            task_type: task.task_type(),
            agent_id: agent.id.clone(),
        });
        if let Err(e) = self.append_log(record).await {
            self.registry.record_completion(&agent.id).await?;
            return Err(e);
        }

        debug!(
            task_id = %task.id().short(),
            agent = %agent.id,
            load = agent.current_load,
            "task assigned"
        );
        Ok((
            held,
            TaskAssignment {
                task_id: task.id(),
                task_type: task.task_type(),
                agent_id: agent.id,
                assigned_at: Utc::now(),
            },
        ))
    }

    /// Pop the next task of `task_type` and assign it.
    ///
    /// On failure the task goes back into the queue unchanged and the error
    /// is returned; `Ok(None)` means the queue was empty.
    pub async fn dispatch_next(&self, task_type: TaskType) -> Result<Option<TaskAssignment>> {
        let Some(task) = self.queue.dequeue(task_type).await else {
            return Ok(None);
        };
        match self.assign_task(&task, None).await {
            Ok(assignment) => Ok(Some(assignment)),
            Err(e) => {
                debug!(task_id = %task.id().short(), error = %e, "assignment failed, requeueing");
                self.queue.requeue(task).await;
                Err(e)
            }
        }
    }

    /// Run the agent holding `assignment` under the response timeout.
    pub async fn run_task(&self, assignment: &TaskAssignment) -> Result<RunOutcome> {
        let task = self
            .in_flight
            .lock()
            .await
            .get(&assignment.task_id)
            .cloned()
            .ok_or(Error::TaskNotFound(assignment.task_id))?;
        let handler = self
            .handlers
            .read()
            .await
            .get(&assignment.agent_id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound {
                id: assignment.agent_id.clone(),
            })?;

        let answer = with_timeout(self.config.agent_response_timeout(), handler.handle(&task)).await;
        match answer {
            Ok(decision) if decision.task_id == task.id() => {
                let id = decision.id;
                self.submit_decision(decision).await?;
                Ok(RunOutcome::Decided(id))
            }
            Ok(decision) => {
                warn!(
                    task_id = %task.id().short(),
                    decision_task = %decision.task_id.short(),
                    "agent answered for a different task"
                );
                self.handle_stalled(task, "decision for a different task").await
            }
            Err(e) => {
                warn!(
                    task_id = %task.id().short(),
                    agent = %assignment.agent_id,
                    error = %e,
                    "agent did not deliver a decision"
                );
                self.handle_stalled(task, &e.to_string()).await
            }
        }
    }

    /// Release a task whose agent stalled and requeue it, or abandon it once
    /// it has used up its retries.
    async fn handle_stalled(&self, mut task: Task, reason: &str) -> Result<RunOutcome> {
        self.in_flight.lock().await.remove(&task.id());
        let Some(agent_id) = task.release() else {
            return Err(Error::Validation(format!(
                "task {} was not assigned",
                task.id()
            )));
        };
        self.registry.record_completion(&agent_id).await?;
        let retries = task.record_retry();

        if retries > self.config.max_task_retries {
            warn!(task_id = %task.id().short(), retries, "task abandoned");
            self.append_log(CoordinationRecord::now(CoordinationEntry::TaskAbandoned {
                task_id: task.id(),
                task_type: task.task_type(),
                retries,
            }))
            .await?;
            self.queue.forget(&task.id()).await;
            self.notify_agents(Event::new(
                topics::COORDINATION,
                SOURCE,
                PlatformEvent::TaskAbandoned {
                    task_id: task.id(),
                    task_type: task.task_type(),
                    retries,
                },
            ))
            .await?;
            return Ok(RunOutcome::Abandoned { retries });
        }

        self.append_log(CoordinationRecord::now(CoordinationEntry::TaskRequeued {
            task_id: task.id(),
            agent_id,
            retry_count: retries,
            reason: reason.to_string(),
        }))
        .await?;
        self.queue.requeue(task).await;
        Ok(RunOutcome::Requeued {
            retry_count: retries,
        })
    }

    /// Buffer an agent's decision for the next coordination cycle.
    ///
    /// The pending record is persisted first. A task has at most one
    /// non-terminal decision at a time.
    pub async fn submit_decision(&self, decision: AgentDecision) -> Result<()> {
        if decision.is_terminal() {
            return Err(Error::Validation(format!(
                "decision {} already has an outcome",
                decision.id
            )));
        }
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&decision.task_id) {
            return Err(Error::DecisionAlreadyActive(decision.task_id));
        }
        self.save_decision(&decision).await?;
        debug!(
            decision_id = %decision.id,
            agent = %decision.agent_id,
            action = %decision.action,
            confidence = %decision.confidence,
            "decision submitted"
        );
        pending.insert(decision.task_id, decision);
        Ok(())
    }

    /// Number of decisions waiting for the next cycle.
    pub async fn pending_decisions(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Number of notifications waiting to be published again.
    pub async fn undelivered(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Arbitrate every buffered decision, then apply or defer the winners.
    ///
    /// Held notifications and unrecorded conflicts from earlier cycles are
    /// settled first. Neither is arbitrated again.
    pub async fn run_coordination_cycle(&self) -> Result<CycleReport> {
        self.flush_outbox().await;
        let mut report = CycleReport::default();
        let unrecorded = std::mem::take(&mut *self.unrecorded.lock().await);
        for resolution in unrecorded {
            self.settle_conflict(resolution, &mut report).await;
        }

        let decisions: Vec<AgentDecision> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, d)| d).collect()
        };
        if decisions.is_empty() {
            return Ok(report);
        }

        let arbitration = self.resolver.arbitrate(decisions);
        for resolution in arbitration.superseded {
            self.settle_conflict(resolution, &mut report).await;
        }

        for decision in arbitration.accepted {
            let trusted = match self.registry.get(&decision.agent_id).await {
                Some(agent) => agent.trusts(decision.confidence),
                None => false,
            };
            let id = decision.id;
            let outcome = if trusted {
                self.apply_decision(&decision).await
            } else {
                self.defer_decision(&decision).await
            };
            match outcome {
                Ok(()) => {
                    self.complete_task(&decision.task_id).await;
                    if trusted {
                        report.applied.push(id);
                    } else {
                        report.deferred.push(id);
                    }
                }
                Err(e) => {
                    error!(decision_id = %id, error = %e, "could not record decision outcome");
                    report.failed.push(id);
                    self.rebuffer(decision).await;
                }
            }
        }

        info!(
            applied = report.applied.len(),
            deferred = report.deferred.len(),
            superseded = report.superseded.len(),
            failed = report.failed.len(),
            "coordination cycle finished"
        );
        Ok(report)
    }

    async fn settle_conflict(&self, resolution: ConflictResolution, report: &mut CycleReport) {
        match self.record_conflict(&resolution).await {
            Ok(()) => {
                self.complete_task(&resolution.loser.task_id).await;
                report.superseded.push(resolution);
            }
            Err(e) => {
                error!(decision_id = %resolution.loser.id, error = %e, "could not record conflict");
                report.failed.push(resolution.loser.id);
                self.unrecorded.lock().await.push(resolution);
            }
        }
    }

    async fn rebuffer(&self, decision: AgentDecision) {
        let pending = AgentDecision {
            outcome: None,
            ..decision
        };
        self.pending.lock().await.insert(pending.task_id, pending);
    }

    async fn apply_decision(&self, decision: &AgentDecision) -> Result<()> {
        self.save_decision(&decision.with_outcome(DecisionOutcome::Applied))
            .await?;
        self.append_log(CoordinationRecord::now(CoordinationEntry::DecisionApplied {
            decision_id: decision.id,
            task_id: decision.task_id,
        }))
        .await?;
        info!(
            decision_id = %decision.id,
            pipeline = %decision.pipeline_id,
            action = %decision.action,
            "decision applied"
        );

        let mut events = vec![Event::new(
            topics::COORDINATION,
            SOURCE,
            PlatformEvent::DecisionApplied {
                decision: decision.clone(),
            },
        )];
        events.extend(
            follow_up_events(decision)
                .into_iter()
                .map(|event| event.with_correlation(decision.id.to_string())),
        );
        self.deliver(events).await;
        Ok(())
    }

    async fn defer_decision(&self, decision: &AgentDecision) -> Result<()> {
        self.save_decision(&decision.with_outcome(DecisionOutcome::Deferred))
            .await?;
        self.append_log(CoordinationRecord::now(CoordinationEntry::DecisionDeferred {
            decision_id: decision.id,
            task_id: decision.task_id,
        }))
        .await?;
        info!(
            decision_id = %decision.id,
            confidence = %decision.confidence,
            "decision deferred for human review"
        );
        self.deliver(vec![Event::new(
            topics::COORDINATION,
            SOURCE,
            PlatformEvent::DecisionDeferred {
                decision: decision.clone(),
            },
        )])
        .await;
        Ok(())
    }

    async fn record_conflict(&self, resolution: &ConflictResolution) -> Result<()> {
        self.save_decision(&resolution.loser).await?;
        self.append_log(CoordinationRecord::now(CoordinationEntry::ConflictResolved {
            pipeline_id: resolution.winner.pipeline_id.clone(),
            winner: resolution.winner.id,
            loser: resolution.loser.id,
            rule: resolution.rule,
        }))
        .await?;
        info!(
            pipeline = %resolution.winner.pipeline_id,
            winner = %resolution.winner.id,
            loser = %resolution.loser.id,
            rule = %resolution.rule,
            "conflict resolved"
        );
        self.deliver(vec![Event::new(
            topics::COORDINATION,
            SOURCE,
            PlatformEvent::ConflictResolved {
                pipeline_id: resolution.winner.pipeline_id.clone(),
                winner: resolution.winner.id,
                loser: resolution.loser.id,
                rule: resolution.rule,
            },
        )])
        .await;
        Ok(())
    }

    /// Arbitrate one conflict and record the superseded decision.
    pub async fn resolve_conflict(&self, conflict: &AgentConflict) -> Result<ConflictResolution> {
        let resolution = self.resolver.resolve(conflict);
        self.record_conflict(&resolution).await?;
        Ok(resolution)
    }

    /// Release the agent holding `task_id` and drop the task.
    pub async fn complete_task(&self, task_id: &TaskId) {
        let held = self.in_flight.lock().await.remove(task_id);
        if let Some(agent_id) = held.as_ref().and_then(Task::assigned_to) {
            if let Err(e) = self.registry.record_completion(agent_id).await {
                debug!(task_id = %task_id.short(), error = %e, "holder already gone");
            }
        }
        self.queue.forget(task_id).await;
    }

    /// Dependency-ordered plan of the queued and in-flight tasks of a
    /// pipeline.
    pub async fn coordinate_agents(&self, pipeline_id: &PipelineId) -> CoordinationPlan {
        let mut tasks = self.queue.pending_for_pipeline(pipeline_id).await;
        tasks.extend(
            self.in_flight
                .lock()
                .await
                .values()
                .filter(|t| t.pipeline_id() == Some(pipeline_id))
                .cloned(),
        );
        CoordinationPlan::build(pipeline_id.clone(), tasks)
    }

    /// Record then publish an event.
    pub async fn notify_agents(&self, event: Event) -> Result<()> {
        self.append_log(CoordinationRecord::now(CoordinationEntry::Notified {
            event_id: event.id,
            topic: event.topic.clone(),
            event_type: event.body.event_type().to_string(),
        }))
        .await?;
        self.channel.publish(event).await
    }

    /// Publish the notifications of an outcome that is already recorded.
    /// Whatever cannot be published is held for the next cycle, after
    /// anything held before it.
    async fn deliver(&self, events: Vec<Event>) {
        let mut held = !self.outbox.lock().await.is_empty();
        for event in events {
            if !held {
                match self.notify_agents(event.clone()).await {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "notification held for the next cycle");
                        held = true;
                    }
                }
            }
            self.outbox.lock().await.push_back(event);
        }
    }

    async fn flush_outbox(&self) {
        let mut outbox = self.outbox.lock().await;
        while let Some(event) = outbox.pop_front() {
            if let Err(e) = self.notify_agents(event.clone()).await {
                warn!(event_id = %event.id, error = %e, "notification still undelivered");
                outbox.push_front(event);
                break;
            }
        }
    }

    async fn save_decision(&self, decision: &AgentDecision) -> Result<()> {
        let store = Arc::clone(&self.store);
        persist_with_retry("agent decision", self.persistence, || {
            store.save_agent_decision(decision)
        })
        .await
    }

    async fn append_log(&self, record: CoordinationRecord) -> Result<()> {
        let store = Arc::clone(&self.store);
        persist_with_retry("coordination log", self.persistence, || {
            store.append_coordination_log(&record)
        })
        .await
    }

    /// Assign queued work of every type until the queues drain or agents run
    /// out of capacity. Each assignment runs on its own task.
    async fn dispatch_ready(self: &Arc<Self>) {
        for task_type in TaskType::ALL {
            loop {
                match self.dispatch_next(task_type).await {
                    Ok(Some(assignment)) => {
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = this.run_task(&assignment).await {
                                warn!(task_id = %assignment.task_id.short(), error = %e, "task run failed");
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(Error::NoEligibleAgent(_)) | Err(Error::CapacityExceeded { .. }) => break,
                    Err(e) => {
                        warn!(task_type = %task_type, error = %e, "dispatch failed");
                        break;
                    }
                }
            }
        }
    }

    /// Start the ingestion, dispatch and coordination loop.
    ///
    /// Ingested events are dispatched immediately; decisions are arbitrated
    /// once per coordination window.
    pub async fn spawn(self: Arc<Self>) -> Result<ActorHandle> {
        let cancel = CancellationToken::new();
        let mut events =
            channel::subscribe_all(self.channel.as_ref(), &topics::INGEST, &cancel).await?;
        let loop_cancel = cancel.clone();
        let period = self.resolver.window().max(Duration::from_millis(10));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        debug!("orchestrator cancelled");
                        break;
                    }
                    next = events.recv() => {
                        let Some(event) = next else {
                            debug!("orchestrator subscriptions closed");
                            break;
                        };
                        if let Err(e) = self.handle(&event).await {
                            warn!(event_id = %event.id, error = %e, "ingestion failed");
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_coordination_cycle().await {
                            error!(error = %e, "coordination cycle failed");
                        }
                        self.dispatch_ready().await;
                    }
                }
            }
        });

        Ok(ActorHandle::new(cancel, join))
    }
}

#[async_trait]
impl EventHandler for Arc<Orchestrator> {
    async fn handle(&self, event: &Event) -> Result<()> {
        if self.ingest(event).await?.is_some() {
            self.dispatch_ready().await;
        }
        Ok(())
    }
}

/// Map an ingested event onto the task it calls for.
fn task_for_event(event: &Event, priorities: &TaskPriorities) -> Result<Option<Task>> {
    let (task_type, pipeline_id, payload) = match &event.body {
        PlatformEvent::ScheduleTick { pipeline_id } => (
            TaskType::Discovery,
            pipeline_id.clone(),
            json!({ "trigger": "schedule" }),
        ),
        PlatformEvent::SourceChanged {
            pipeline_id,
            source_id,
        } => (
            TaskType::Discovery,
            pipeline_id.clone(),
            json!({ "trigger": "source_changed", "source_id": source_id }),
        ),
        PlatformEvent::SchemaChanged {
            pipeline_id,
            source_id,
            schema_version,
            changes,
        } => (
            TaskType::Mapping,
            pipeline_id.clone(),
            json!({
                "source_id": source_id,
                "schema_version": schema_version,
                "changes": changes,
            }),
        ),
        PlatformEvent::PipelineFailed { error } => (
            TaskType::ErrorResolution,
            error.pipeline_id.clone(),
            serde_json::to_value(error)?,
        ),
        _ => return Ok(None),
    };
    Ok(Some(
        Task::new(task_type, priorities.for_type(task_type), payload)
            .for_pipeline(pipeline_id)
            .with_created_at(event.timestamp),
    ))
}

/// Events an applied decision triggers besides `DecisionApplied` itself.
fn follow_up_events(decision: &AgentDecision) -> Vec<Event> {
    let pipeline_id = decision.pipeline_id.clone();
    let control = |command| {
        Event::new(
            topics::PIPELINE_CONTROL,
            SOURCE,
            PlatformEvent::PipelineControl {
                pipeline_id: pipeline_id.clone(),
                command,
            },
        )
    };
    match &decision.action {
        DecisionAction::UpdateCatalog => vec![Event::new(
            topics::DISCOVERY,
            SOURCE,
            PlatformEvent::CatalogUpdated {
                pipeline_id: pipeline_id.clone(),
            },
        )],
        DecisionAction::UpdateMapping { schema_version } => vec![
            Event::new(
                topics::MAPPING,
                SOURCE,
                PlatformEvent::MappingUpdated {
                    pipeline_id: pipeline_id.clone(),
                    schema_version: *schema_version,
                },
            ),
            control(PipelineCommand::Resume),
        ],
        DecisionAction::PausePipeline => vec![control(PipelineCommand::Pause)],
        DecisionAction::ResumePipeline => vec![control(PipelineCommand::Resume)],
        // Remediation actions are carried out by the self-healer on
        // `DecisionApplied`.
        DecisionAction::Retry
        | DecisionAction::Skip
        | DecisionAction::AdjustConfig { .. }
        | DecisionAction::Escalate => Vec::new(),
    }
}
