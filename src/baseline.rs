//! Reference baseline
//!
//! The scoring engine compares a subject's task statistics against a fixed
//! normative recording. The table is versioned, constant for the process
//! lifetime, and loadable from JSON for deployments that ship their own
//! normative data.

use crate::error::SessionError;
use crate::types::{Leg, Metric, MetricSummary};
use serde::{Deserialize, Serialize};

/// Version of the built-in normative recording
pub const BASELINE_VERSION: &str = "2024.1";

/// Expected per-limb statistics from a normative jump-landing recording.
///
/// Same shape as one task's statistic bundle, but every metric is required:
/// a baseline with holes is a deployment error, not a runtime condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceBaseline {
    pub version: String,
    pub left_flexion: MetricSummary,
    pub right_flexion: MetricSummary,
    pub left_abduction: MetricSummary,
    pub right_abduction: MetricSummary,
}

impl ReferenceBaseline {
    /// The built-in normative recording.
    ///
    /// Values aggregated from a single reference subject performing the
    /// jump-landing screen with healthy mechanics: deep symmetric flexion
    /// on landing, minimal abduction excursion.
    pub fn normative() -> Self {
        Self {
            version: BASELINE_VERSION.to_string(),
            left_flexion: MetricSummary {
                mean: 58.4,
                min: 2.1,
                max: 84.6,
                std: 14.2,
                median: 60.3,
                range: 82.5,
            },
            right_flexion: MetricSummary {
                mean: 57.9,
                min: 1.8,
                max: 83.9,
                std: 13.8,
                median: 59.7,
                range: 82.1,
            },
            left_abduction: MetricSummary {
                mean: 4.6,
                min: -3.2,
                max: 11.4,
                std: 2.7,
                median: 4.3,
                range: 14.6,
            },
            right_abduction: MetricSummary {
                mean: 4.2,
                min: -2.9,
                max: 10.8,
                std: 2.5,
                median: 4.0,
                range: 13.7,
            },
        }
    }

    /// Look up the reference summary for a (leg, metric) pair
    pub fn metric(&self, leg: Leg, metric: Metric) -> &MetricSummary {
        match (leg, metric) {
            (Leg::Left, Metric::Flexion) => &self.left_flexion,
            (Leg::Right, Metric::Flexion) => &self.right_flexion,
            (Leg::Left, Metric::Abduction) => &self.left_abduction,
            (Leg::Right, Metric::Abduction) => &self.right_abduction,
        }
    }

    /// Load a baseline table from JSON
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let baseline: Self = serde_json::from_str(json)?;
        Ok(baseline)
    }

    /// Serialize the baseline table to JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for ReferenceBaseline {
    fn default() -> Self {
        Self::normative()
    }
}
