//! Conflict resolution between agent decisions.
//!
//! Two decisions conflict when they target the same pipeline, propose
//! incompatible actions, and were issued within the coordination window of
//! each other. Arbitration is total and deterministic: the rules below are
//! applied in order until one separates the pair.
//!
//! 1. Higher agent-declared confidence wins.
//! 2. Higher static agent-type priority wins
//!    (`error_resolution > schema_mapping > discovery` by default).
//! 3. Earlier timestamp wins.
//! 4. Lower decision id wins. Only reached by decisions identical in every
//!    other respect; it exists so the order is total.
//!
//! The loser is never dropped: it is returned as a terminal copy with
//! outcome `superseded` for the caller to persist.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PriorityTable;
use crate::core::{AgentDecision, DecisionOutcome, PipelineId};

/// Which rule separated winner from loser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    Confidence,
    AgentPriority,
    Timestamp,
    DecisionId,
}

impl std::fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionRule::Confidence => "confidence",
            ResolutionRule::AgentPriority => "agent_priority",
            ResolutionRule::Timestamp => "timestamp",
            ResolutionRule::DecisionId => "decision_id",
        };
        write!(f, "{s}")
    }
}

/// A pair of decisions that cannot both be applied. Derived, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConflict {
    pub first: AgentDecision,
    pub second: AgentDecision,
}

impl AgentConflict {
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.first.pipeline_id
    }
}

/// Result of arbitrating one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub winner: AgentDecision,
    /// Terminal copy of the losing decision, outcome `superseded`.
    pub loser: AgentDecision,
    pub rule: ResolutionRule,
}

/// Result of arbitrating a whole coordination cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arbitration {
    /// Mutually compatible decisions, best-ranked first per pipeline.
    pub accepted: Vec<AgentDecision>,
    pub superseded: Vec<ConflictResolution>,
}

pub struct ConflictResolver {
    priorities: PriorityTable,
    window: Duration,
}

impl ConflictResolver {
    pub fn new(priorities: PriorityTable, window: Duration) -> Self {
        Self { priorities, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether `a` and `b` form a conflict.
    pub fn detect(&self, a: &AgentDecision, b: &AgentDecision) -> Option<AgentConflict> {
        if a.id == b.id || a.pipeline_id != b.pipeline_id || !a.action.conflicts_with(&b.action) {
            return None;
        }
        let apart = if a.timestamp >= b.timestamp {
            a.timestamp - b.timestamp
        } else {
            b.timestamp - a.timestamp
        };
        let apart = apart.to_std().ok()?;
        if apart > self.window {
            return None;
        }
        Some(AgentConflict {
            first: a.clone(),
            second: b.clone(),
        })
    }

    /// Every conflicting pair among `decisions`.
    pub fn find_conflicts(&self, decisions: &[AgentDecision]) -> Vec<AgentConflict> {
        let mut conflicts = Vec::new();
        for (i, a) in decisions.iter().enumerate() {
            for b in &decisions[i + 1..] {
                if let Some(conflict) = self.detect(a, b) {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }

    /// Compare two decisions. `Greater` means `a` wins.
    pub fn rank(&self, a: &AgentDecision, b: &AgentDecision) -> (Ordering, ResolutionRule) {
        let by_confidence = a.confidence.cmp(&b.confidence);
        if by_confidence != Ordering::Equal {
            return (by_confidence, ResolutionRule::Confidence);
        }
        let by_priority = self
            .priorities
            .priority(a.agent_type)
            .cmp(&self.priorities.priority(b.agent_type));
        if by_priority != Ordering::Equal {
            return (by_priority, ResolutionRule::AgentPriority);
        }
        let by_time = b.timestamp.cmp(&a.timestamp);
        if by_time != Ordering::Equal {
            return (by_time, ResolutionRule::Timestamp);
        }
        (b.id.cmp(&a.id), ResolutionRule::DecisionId)
    }

    /// Arbitrate a single conflict.
    pub fn resolve(&self, conflict: &AgentConflict) -> ConflictResolution {
        let (ordering, rule) = self.rank(&conflict.first, &conflict.second);
        let (winner, loser) = if ordering == Ordering::Less {
            (&conflict.second, &conflict.first)
        } else {
            (&conflict.first, &conflict.second)
        };
        ConflictResolution {
            winner: winner.clone(),
            loser: loser.with_outcome(DecisionOutcome::Superseded),
            rule,
        }
    }

    /// Arbitrate every decision of a coordination cycle.
    ///
    /// Per pipeline, decisions are visited best-ranked first. A decision is
    /// accepted unless it conflicts with one already accepted, in which case
    /// that accepted decision supersedes it.
    pub fn arbitrate(&self, decisions: Vec<AgentDecision>) -> Arbitration {
        let mut by_pipeline: BTreeMap<PipelineId, Vec<AgentDecision>> = BTreeMap::new();
        for decision in decisions {
            by_pipeline
                .entry(decision.pipeline_id.clone())
                .or_default()
                .push(decision);
        }

        let mut result = Arbitration::default();
        for (_, mut group) in by_pipeline {
            group.sort_by(|a, b| self.rank(b, a).0);
            let mut accepted: Vec<AgentDecision> = Vec::new();
            for candidate in group {
                let beaten_by = accepted
                    .iter()
                    .find_map(|winner| self.detect(winner, &candidate));
                match beaten_by {
                    Some(conflict) => result.superseded.push(self.resolve(&conflict)),
                    None => accepted.push(candidate),
                }
            }
            result.accepted.extend(accepted);
        }
        result
    }
}
