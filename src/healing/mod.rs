//! Error self-healing loop.
//!
//! A `PipelineError` raised by an engine moves through
//! `captured -> diagnosing -> {resolving, escalated}` and
//! `resolving -> {resolved, escalated}`. Diagnosis consults every past
//! `Resolution` for the same (error type, pipeline type); resolution retries
//! with capped exponential backoff and a persisted attempt counter, and
//! escalates to an operator once the policy's attempts are spent.

mod agent;
mod backoff;
mod healer;
mod patterns;
mod types;

pub use agent::HealingAgent;
pub use backoff::{delay_for, schedule};
pub use healer::{action_for, RemediationExecutor, SelfHealer, DEFAULT_RETRY_CONFIDENCE};
pub use patterns::{PatternMatch, PatternStore};
pub use types::{
    ConfigDelta, Diagnosis, ErrorId, ErrorType, HealingState, PipelineError, Resolution, Strategy,
};
