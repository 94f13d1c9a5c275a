//! Trust scoring for fetched series

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::series::FetchResult;
use crate::core::source::SourceId;

/// Penalties applied by [`QualityScorer`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QualityPolicy {
    pub secondary_penalty: u8,
    pub tertiary_penalty: u8,
    pub synthetic_penalty: u8,
    /// Fraction of the expected point count below which a series counts as incomplete.
    pub completeness_threshold: f64,
    pub incomplete_penalty: u8,
    pub staleness_grace_secs: u64,
    pub stale_penalty_per_minute: f64,
    pub max_stale_penalty: u8,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        QualityPolicy {
            secondary_penalty: 20,
            tertiary_penalty: 30,
            synthetic_penalty: 85,
            completeness_threshold: 0.8,
            incomplete_penalty: 20,
            staleness_grace_secs: 15 * 60,
            stale_penalty_per_minute: 1.0,
            max_stale_penalty: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFactor {
    SecondarySource,
    TertiarySource,
    SyntheticSource,
    Incomplete,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityScore {
    pub value: u8,
    pub reasons: BTreeSet<QualityFactor>,
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    policy: QualityPolicy,
}

impl QualityScorer {
    pub fn new(policy: QualityPolicy) -> Self {
        QualityScorer { policy }
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    /// Scores `result` as of `now`. Depends on nothing but its arguments.
    pub fn score(
        &self,
        result: &FetchResult,
        expected_points: usize,
        now: DateTime<Utc>,
    ) -> QualityScore {
        let policy = &self.policy;
        let mut value = 100.0_f64;
        let mut reasons = BTreeSet::new();

        let tier = match result.source_id {
            SourceId::Primary => None,
            SourceId::Secondary => Some((policy.secondary_penalty, QualityFactor::SecondarySource)),
            SourceId::Tertiary => Some((policy.tertiary_penalty, QualityFactor::TertiarySource)),
            SourceId::Synthetic => Some((policy.synthetic_penalty, QualityFactor::SyntheticSource)),
        };
        if let Some((penalty, factor)) = tier {
            value -= f64::from(penalty);
            reasons.insert(factor);
        }

        let required = expected_points as f64 * policy.completeness_threshold;
        if (result.points.len() as f64) < required {
            value -= f64::from(policy.incomplete_penalty);
            reasons.insert(QualityFactor::Incomplete);
        }

        let age_secs = (now - result.fetched_at).num_seconds();
        let overdue_secs = age_secs - policy.staleness_grace_secs as i64;
        if overdue_secs > 0 {
            let penalty = (overdue_secs as f64 / 60.0 * policy.stale_penalty_per_minute)
                .min(f64::from(policy.max_stale_penalty));
            if penalty > 0.0 {
                value -= penalty;
                reasons.insert(QualityFactor::Stale);
            }
        }

        QualityScore {
            value: value.clamp(0.0, 100.0).round() as u8,
            reasons,
        }
    }
}
