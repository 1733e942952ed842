//! The capture -> diagnose -> resolve -> escalate loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::backoff::delay_for;
use super::patterns::PatternStore;
use super::types::{
    ConfigDelta, Diagnosis, ErrorId, HealingState, PipelineError, Resolution, Strategy,
};
use crate::channel::{topics, Event, EventChannel, EventHandler, PlatformEvent, ProcessedEvents};
use crate::config::Config;
use crate::core::{Confidence, DecisionAction, TaskId};
use crate::store::{persist_with_retry, MetadataStore, RetryPolicy};
use crate::{Error, Result};

const SOURCE: &str = "self-healer";

/// Confidence reported for the default `retry` when no pattern matches.
pub const DEFAULT_RETRY_CONFIDENCE: f64 = 0.9;

/// Side effects of the remediation strategies, provided by the engine side.
#[async_trait]
pub trait RemediationExecutor: Send + Sync {
    /// Re-run the failed execution.
    async fn retry(&self, error: &PipelineError) -> Result<()>;

    /// Discard the offending record and resume.
    async fn skip(&self, error: &PipelineError) -> Result<()>;

    /// Apply an already validated configuration delta and resume.
    async fn adjust_config(&self, error: &PipelineError, delta: &ConfigDelta) -> Result<()>;
}

struct Case {
    error: PipelineError,
    state: HealingState,
    diagnosis: Option<Diagnosis>,
    resolution: Option<Resolution>,
}

enum Outcome {
    Resolved(Strategy),
    Escalated(String),
}

/// Owns every captured `PipelineError` until it has a terminal `Resolution`.
pub struct SelfHealer {
    config: Config,
    store: Arc<dyn MetadataStore>,
    channel: Arc<dyn EventChannel>,
    executor: Arc<dyn RemediationExecutor>,
    persistence: RetryPolicy,
    auto_resolve: bool,
    cases: Mutex<HashMap<ErrorId, Case>>,
    patterns: RwLock<PatternStore>,
    tasks: Mutex<HashMap<TaskId, ErrorId>>,
    processed: Mutex<ProcessedEvents>,
}

impl SelfHealer {
    /// Create a healer, seeding the pattern store from persisted resolutions.
    pub fn new(
        config: Config,
        store: Arc<dyn MetadataStore>,
        channel: Arc<dyn EventChannel>,
        executor: Arc<dyn RemediationExecutor>,
    ) -> Result<Self> {
        let history = store.load_resolutions()?;
        debug!(resolutions = history.len(), "SelfHealer::new");
        Ok(Self {
            persistence: RetryPolicy::from_config(&config.orchestrator),
            config,
            store,
            channel,
            executor,
            auto_resolve: false,
            cases: Mutex::new(HashMap::new()),
            patterns: RwLock::new(PatternStore::from_history(history)),
            tasks: Mutex::new(HashMap::new()),
            processed: Mutex::new(ProcessedEvents::new()),
        })
    }

    /// Resolve captured errors immediately instead of waiting for an
    /// error-resolution agent's decision.
    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    pub fn with_persistence(mut self, policy: RetryPolicy) -> Self {
        self.persistence = policy;
        self
    }

    /// Take ownership of an engine failure. Capturing the same error twice
    /// is a no-op; an escalated error is refused.
    pub async fn capture(&self, error: PipelineError) -> Result<ErrorId> {
        let id = error.id;
        if let Some(previous) = self.patterns.read().await.resolution_for(&id) {
            if previous.is_escalated() {
                return Err(Error::AlreadyEscalated(id));
            }
        }

        let mut cases = self.cases.lock().await;
        if let Some(case) = cases.get(&id) {
            if case.state == HealingState::Escalated {
                return Err(Error::AlreadyEscalated(id));
            }
            return Ok(id);
        }

        info!(
            error_id = %id,
            pipeline = %error.pipeline_id,
            error_type = %error.error_type,
            "pipeline error captured"
        );
        cases.insert(
            id,
            Case {
                error,
                state: HealingState::Captured,
                diagnosis: None,
                resolution: None,
            },
        );
        Ok(id)
    }

    pub async fn state(&self, error_id: &ErrorId) -> Option<HealingState> {
        self.cases.lock().await.get(error_id).map(|c| c.state)
    }

    pub async fn resolution(&self, error_id: &ErrorId) -> Option<Resolution> {
        self.cases
            .lock()
            .await
            .get(error_id)
            .and_then(|c| c.resolution.clone())
    }

    /// Remember which error-resolution task is handling an error.
    pub async fn link_task(&self, task_id: TaskId, error_id: ErrorId) {
        self.tasks.lock().await.insert(task_id, error_id);
    }

    /// Classify the error and pick a candidate strategy from history.
    pub async fn diagnose_error(&self, error_id: &ErrorId) -> Result<Diagnosis> {
        let error = {
            let mut cases = self.cases.lock().await;
            let case = cases.get_mut(error_id).ok_or(Error::ErrorNotFound(*error_id))?;
            match case.state {
                HealingState::Escalated => return Err(Error::AlreadyEscalated(*error_id)),
                HealingState::Captured => case.state = HealingState::Diagnosing,
                HealingState::Diagnosing => {
                    if let Some(diagnosis) = &case.diagnosis {
                        return Ok(diagnosis.clone());
                    }
                }
                other => {
                    return Err(Error::InvalidTransition {
                        from: other.to_string(),
                        to: HealingState::Diagnosing.to_string(),
                    })
                }
            }
            case.error.clone()
        };

        let found = self
            .patterns
            .read()
            .await
            .candidate(error.error_type, error.pipeline_type);

        let diagnosis = match found {
            Some(m) => Diagnosis {
                error_id: *error_id,
                error_type: error.error_type,
                candidate: m.strategy,
                delta: m.delta,
                supporting: m.successes,
                confidence: Confidence::clamped(m.success_rate),
            },
            None => Diagnosis {
                error_id: *error_id,
                error_type: error.error_type,
                candidate: Strategy::Retry,
                delta: None,
                supporting: 0,
                confidence: Confidence::clamped(DEFAULT_RETRY_CONFIDENCE),
            },
        };

        debug!(
            error_id = %error_id,
            candidate = %diagnosis.candidate,
            supporting = diagnosis.supporting,
            "diagnosed"
        );
        if let Some(case) = self.cases.lock().await.get_mut(error_id) {
            case.diagnosis = Some(diagnosis.clone());
        }
        Ok(diagnosis)
    }

    /// Execute the diagnosed candidate strategy.
    pub async fn resolve_error(&self, error_id: &ErrorId) -> Result<Resolution> {
        let diagnosis = self.diagnose_error(error_id).await?;
        self.resolve_with(error_id, diagnosis.candidate, diagnosis.delta)
            .await
    }

    /// Execute a specific strategy.
    ///
    /// `skip` and `adjust_config` fall back to `retry` when they fail or the
    /// delta is rejected. Every attempt is persisted before it runs; once the
    /// policy's `max_attempts` is spent the error is escalated.
    pub async fn resolve_with(
        &self,
        error_id: &ErrorId,
        strategy: Strategy,
        delta: Option<ConfigDelta>,
    ) -> Result<Resolution> {
        if self.state(error_id).await == Some(HealingState::Captured) {
            self.diagnose_error(error_id).await?;
        }

        let error = {
            let mut cases = self.cases.lock().await;
            let case = cases.get_mut(error_id).ok_or(Error::ErrorNotFound(*error_id))?;
            match case.state {
                HealingState::Escalated => return Err(Error::AlreadyEscalated(*error_id)),
                HealingState::Resolved => {
                    if let Some(resolution) = &case.resolution {
                        return Ok(resolution.clone());
                    }
                }
                HealingState::Diagnosing => {}
                other => {
                    return Err(Error::InvalidTransition {
                        from: other.to_string(),
                        to: HealingState::Resolving.to_string(),
                    })
                }
            }
            if strategy != Strategy::Escalate {
                case.state = HealingState::Resolving;
            }
            case.error.clone()
        };

        let result = self.run_strategy(&error, strategy, delta).await;
        let resolution = match result {
            Ok(resolution) => resolution,
            Err(e) => {
                // Attempts are persisted, so a later call resumes the count.
                self.set_state(error_id, HealingState::Diagnosing).await;
                return Err(e);
            }
        };

        let persisted = persist_with_retry("resolution", self.persistence, || {
            self.store.save_resolution(&resolution)
        })
        .await;
        if let Err(e) = persisted {
            self.set_state(error_id, HealingState::Diagnosing).await;
            return Err(e);
        }
        self.patterns.write().await.record(resolution.clone());

        let final_state = if resolution.is_escalated() {
            HealingState::Escalated
        } else {
            HealingState::Resolved
        };
        if let Some(case) = self.cases.lock().await.get_mut(error_id) {
            case.state = final_state;
            case.resolution = Some(resolution.clone());
        }

        let body = if resolution.is_escalated() {
            error!(
                error_id = %error_id,
                pipeline = %resolution.pipeline_id,
                error_type = %resolution.error_type,
                attempts = resolution.attempts,
                "pipeline error escalated"
            );
            PlatformEvent::ErrorEscalated {
                resolution: resolution.clone(),
            }
        } else {
            info!(
                error_id = %error_id,
                pipeline = %resolution.pipeline_id,
                strategy = %resolution.strategy,
                attempts = resolution.attempts,
                "pipeline error resolved"
            );
            PlatformEvent::ErrorResolved {
                resolution: resolution.clone(),
            }
        };
        self.channel
            .publish(
                Event::new(topics::PIPELINE_EVENTS, SOURCE, body)
                    .with_correlation(error_id.to_string()),
            )
            .await?;

        Ok(resolution)
    }

    async fn set_state(&self, error_id: &ErrorId, state: HealingState) {
        if let Some(case) = self.cases.lock().await.get_mut(error_id) {
            case.state = state;
        }
    }

    async fn run_strategy(
        &self,
        error: &PipelineError,
        strategy: Strategy,
        delta: Option<ConfigDelta>,
    ) -> Result<Resolution> {
        let policy = self.config.policy_for(&error.pipeline_id);
        let mut attempts = self.store.load_attempts(&error.id)?.unwrap_or(0);
        let mut actions = Vec::new();
        let mut current = strategy;

        let mut delta = delta;
        if current == Strategy::AdjustConfig {
            let checked = match &delta {
                Some(d) => policy.check_adjustment(d),
                None => Err(Error::AdjustmentNotAllowed("no delta proposed".into())),
            };
            if let Err(e) = checked {
                warn!(error_id = %error.id, error = %e, "adjustment rejected, falling back to retry");
                actions.push(format!("adjust_config rejected: {e}"));
                current = Strategy::Retry;
                delta = None;
            }
        }

        let outcome = loop {
            if current == Strategy::Escalate {
                break Outcome::Escalated("escalation requested".into());
            }
            if attempts >= policy.max_attempts {
                break Outcome::Escalated(format!("max attempts ({}) reached", policy.max_attempts));
            }

            attempts += 1;
            let count = attempts;
            persist_with_retry("attempts", self.persistence, || {
                self.store.save_attempts(&error.id, count)
            })
            .await?;

            let result = match (current, &delta) {
                (Strategy::Skip, _) => {
                    actions.push("skip offending record".to_string());
                    self.executor.skip(error).await
                }
                (Strategy::AdjustConfig, Some(d)) => {
                    actions.push(format!("adjust_config {}", json!(d)));
                    self.executor.adjust_config(error, d).await
                }
                _ => {
                    let delay = delay_for(attempts, policy.base_backoff(), policy.max_backoff());
                    actions.push(format!("retry #{attempts} after {}ms", delay.as_millis()));
                    debug!(error_id = %error.id, attempt = attempts, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    self.executor.retry(error).await
                }
            };

            match result {
                Ok(()) => break Outcome::Resolved(current),
                Err(e) => {
                    warn!(error_id = %error.id, attempt = attempts, strategy = %current, error = %e, "remediation failed");
                    actions.push(format!("{current} failed: {e}"));
                    current = Strategy::Retry;
                }
            }
        };

        let mut context = error.context.clone();
        context.insert("message".into(), json!(error.message));
        context.insert("execution_id".into(), json!(error.execution_id));

        let (strategy, success, delta) = match outcome {
            Outcome::Resolved(strategy) => {
                let delta = if strategy == Strategy::AdjustConfig { delta } else { None };
                (strategy, true, delta)
            }
            Outcome::Escalated(reason) => {
                context.insert("escalation_reason".into(), json!(reason));
                context.insert("error_type".into(), json!(error.error_type));
                context.insert("attempts".into(), json!(attempts));
                (Strategy::Escalate, false, None)
            }
        };

        Ok(Resolution {
            error_id: error.id,
            pipeline_id: error.pipeline_id.clone(),
            pipeline_type: error.pipeline_type,
            error_type: error.error_type,
            strategy,
            actions,
            success,
            attempts,
            delta,
            applied_at: Utc::now(),
            context,
        })
    }

    fn strategy_for(action: &DecisionAction) -> Option<(Strategy, Option<ConfigDelta>)> {
        match action {
            DecisionAction::Retry => Some((Strategy::Retry, None)),
            DecisionAction::Skip => Some((Strategy::Skip, None)),
            DecisionAction::AdjustConfig { delta } => Some((Strategy::AdjustConfig, Some(delta.clone()))),
            DecisionAction::Escalate => Some((Strategy::Escalate, None)),
            _ => None,
        }
    }
}

#[async_trait]
impl EventHandler for SelfHealer {
    /// Captures `PipelineFailed` and executes applied error-resolution
    /// decisions for linked tasks.
    async fn handle(&self, event: &Event) -> Result<()> {
        if !self.processed.lock().await.first_delivery(event.id) {
            debug!(event_id = %event.id, "duplicate delivery ignored");
            return Ok(());
        }

        match &event.body {
            PlatformEvent::PipelineFailed { error } => {
                let id = self.capture(error.clone()).await?;
                if self.auto_resolve {
                    self.resolve_error(&id).await?;
                }
            }
            PlatformEvent::DecisionApplied { decision } => {
                let linked = self.tasks.lock().await.get(&decision.task_id).copied();
                let Some(error_id) = linked else {
                    return Ok(());
                };
                let Some((strategy, delta)) = Self::strategy_for(&decision.action) else {
                    return Ok(());
                };
                self.resolve_with(&error_id, strategy, delta).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Map a diagnosis onto the decision action an agent proposes.
pub fn action_for(diagnosis: &Diagnosis) -> DecisionAction {
    match diagnosis.candidate {
        Strategy::Retry => DecisionAction::Retry,
        Strategy::Skip => DecisionAction::Skip,
        Strategy::AdjustConfig => DecisionAction::AdjustConfig {
            delta: diagnosis.delta.clone().unwrap_or_default(),
        },
        Strategy::Escalate => DecisionAction::Escalate,
    }
}
