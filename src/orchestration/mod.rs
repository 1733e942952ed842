//! Coordination of autonomous agents.
//!
//! The [`Orchestrator`] turns inbound events into prioritized tasks, hands
//! them to the least-loaded capable agent in the [`AgentRegistry`], gates
//! the returned decisions on confidence and arbitrates conflicting ones
//! through the [`ConflictResolver`].

mod orchestrator;
mod plan;
mod queue;
mod registry;
mod resolver;

pub use orchestrator::{CycleReport, Orchestrator, RunOutcome, TaskAssignment};
pub use plan::{CoordinationPlan, PlanStep, StepStatus};
pub use queue::TaskQueue;
pub use registry::AgentRegistry;
pub use resolver::{AgentConflict, Arbitration, ConflictResolution, ConflictResolver, ResolutionRule};
