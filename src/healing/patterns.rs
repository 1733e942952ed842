//! Historical resolutions consulted by diagnosis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::types::{ConfigDelta, ErrorId, ErrorType, Resolution, Strategy};
use crate::core::PipelineType;

/// Candidate strategy derived from past resolutions.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub strategy: Strategy,
    pub delta: Option<ConfigDelta>,
    pub successes: usize,
    /// Share of resolutions with this strategy that succeeded.
    pub success_rate: f64,
}

#[derive(Default)]
struct Tally {
    successes: usize,
    total: usize,
    latest_success: Option<DateTime<Utc>>,
    latest_delta: Option<ConfigDelta>,
}

/// Append-only history of every resolution, successful or not.
#[derive(Debug, Clone, Default)]
pub struct PatternStore {
    resolutions: Vec<Resolution>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(resolutions: Vec<Resolution>) -> Self {
        Self { resolutions }
    }

    pub fn record(&mut self, resolution: Resolution) {
        self.resolutions.push(resolution);
    }

    pub fn len(&self) -> usize {
        self.resolutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolutions.is_empty()
    }

    /// Latest recorded resolution of a specific error.
    pub fn resolution_for(&self, error_id: &ErrorId) -> Option<&Resolution> {
        self.resolutions.iter().rev().find(|r| &r.error_id == error_id)
    }

    /// Best strategy for errors of `error_type` on pipelines of `pipeline_type`.
    ///
    /// The strategy with the most successful resolutions wins; ties go to the
    /// one that succeeded most recently. Escalations never count.
    pub fn candidate(&self, error_type: ErrorType, pipeline_type: PipelineType) -> Option<PatternMatch> {
        let mut tallies: BTreeMap<Strategy, Tally> = BTreeMap::new();
        for r in self
            .resolutions
            .iter()
            .filter(|r| r.error_type == error_type && r.pipeline_type == pipeline_type)
            .filter(|r| r.strategy != Strategy::Escalate)
        {
            let tally = tallies.entry(r.strategy).or_default();
            tally.total += 1;
            if r.success {
                tally.successes += 1;
                if tally.latest_success.map_or(true, |t| r.applied_at >= t) {
                    tally.latest_success = Some(r.applied_at);
                    tally.latest_delta = r.delta.clone();
                }
            }
        }

        tallies
            .into_iter()
            .filter(|(_, t)| t.successes > 0)
            .max_by(|(_, a), (_, b)| {
                a.successes
                    .cmp(&b.successes)
                    .then(a.latest_success.cmp(&b.latest_success))
            })
            .map(|(strategy, t)| PatternMatch {
                strategy,
                delta: t.latest_delta,
                successes: t.successes,
                success_rate: t.successes as f64 / t.total as f64,
            })
    }
}
