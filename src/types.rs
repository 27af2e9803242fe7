//! Core types for the assessment pipeline
//!
//! This module defines the data that flows between the sensor service, the
//! session coordinator and the scoring engine: per-task statistic bundles,
//! the reference comparison shape, and computed risk results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body side a metric was measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Left,
    Right,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Left => "left",
            Leg::Right => "right",
        }
    }
}

/// Knee angle metric tracked by the assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Flexion,
    Abduction,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Flexion => "flexion",
            Metric::Abduction => "abduction",
        }
    }
}

/// Wire key for a (leg, metric) pair, e.g. `left_flexion`
pub fn metric_key(leg: Leg, metric: Metric) -> String {
    format!("{}_{}", leg.as_str(), metric.as_str())
}

/// Aggregated summary of one angle signal over one task recording (degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub median: f64,
    pub range: f64,
}

impl MetricSummary {
    /// Summary of a constant signal, used when adapting legacy flat payloads
    pub fn from_scalar(value: f64) -> Self {
        Self {
            mean: value,
            min: value,
            max: value,
            std: 0.0,
            median: value,
            range: 0.0,
        }
    }

    /// A summary is usable for scoring only if its mean is a real number
    pub fn is_usable(&self) -> bool {
        self.mean.is_finite()
    }
}

/// Recording metadata attached to a task result by the sensor service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub duration_seconds: f64,
    pub sample_count: u64,
    pub sampling_rate_hz: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_timestamp: Option<String>,
}

/// Left/right symmetry comparison computed by the sensor service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymmetryMetrics {
    pub flexion_difference_mean: f64,
    pub flexion_difference_max: f64,
    pub abduction_difference_mean: f64,
    pub abduction_difference_max: f64,
}

/// Per-task statistic bundle delivered by the sensor service.
///
/// Individual metrics may be absent (the scoring engine treats a missing
/// metric as insufficient data rather than an error); a payload carrying no
/// metrics at all is rejected as structurally invalid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_info: Option<RecordingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_flexion: Option<MetricSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_flexion: Option<MetricSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_abduction: Option<MetricSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_abduction: Option<MetricSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetry_metrics: Option<SymmetryMetrics>,
}

impl StatisticBundle {
    /// Look up the summary for a (leg, metric) pair
    pub fn metric(&self, leg: Leg, metric: Metric) -> Option<&MetricSummary> {
        match (leg, metric) {
            (Leg::Left, Metric::Flexion) => self.left_flexion.as_ref(),
            (Leg::Right, Metric::Flexion) => self.right_flexion.as_ref(),
            (Leg::Left, Metric::Abduction) => self.left_abduction.as_ref(),
            (Leg::Right, Metric::Abduction) => self.right_abduction.as_ref(),
        }
    }

    /// True if at least one metric summary is present
    pub fn has_any_metric(&self) -> bool {
        self.left_flexion.is_some()
            || self.right_flexion.is_some()
            || self.left_abduction.is_some()
            || self.right_abduction.is_some()
    }
}

/// Legacy flat task result still emitted by older sensor service builds.
///
/// Carries single angles and precomputed per-knee risks instead of full
/// summaries. The angles are adapted into scalar summaries and rescored
/// through the canonical engine; the embedded risks are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyTaskResult {
    pub left_knee_flexion: f64,
    pub left_knee_valgus: f64,
    pub left_knee_risk: f64,
    pub right_knee_flexion: f64,
    pub right_knee_valgus: f64,
    pub right_knee_risk: f64,
}

impl LegacyTaskResult {
    pub fn into_bundle(self) -> StatisticBundle {
        StatisticBundle {
            recording_info: None,
            left_flexion: Some(MetricSummary::from_scalar(self.left_knee_flexion)),
            right_flexion: Some(MetricSummary::from_scalar(self.right_knee_flexion)),
            left_abduction: Some(MetricSummary::from_scalar(self.left_knee_valgus)),
            right_abduction: Some(MetricSummary::from_scalar(self.right_knee_valgus)),
            symmetry_metrics: None,
        }
    }
}

/// Either wire shape of a `task_result` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResultPayload {
    Legacy(LegacyTaskResult),
    Bundle(StatisticBundle),
}

impl TaskResultPayload {
    pub fn into_bundle(self) -> StatisticBundle {
        match self {
            TaskResultPayload::Legacy(legacy) => legacy.into_bundle(),
            TaskResultPayload::Bundle(bundle) => bundle,
        }
    }
}

/// Qualitative risk band for an overall risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl RiskLevel {
    /// Classify an overall risk score into a band.
    ///
    /// Band boundaries are inclusive on the upper end: 25 is `Low`,
    /// anything above 25 up to and including 50 is `Moderate`, and so on.
    pub fn from_score(score: f64) -> Self {
        if score <= 25.0 {
            RiskLevel::Low
        } else if score <= 50.0 {
            RiskLevel::Moderate
        } else if score <= 75.0 {
            RiskLevel::High
        } else {
            RiskLevel::VeryHigh
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::VeryHigh => "very_high",
        }
    }
}

/// Risk percentages for one leg, integer-rounded to 0..=100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegRisk {
    pub flexion_risk: u8,
    pub abduction_risk: u8,
    pub overall_risk: u8,
}

/// Per-leg risk breakdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerLegRisk {
    pub left: LegRisk,
    pub right: LegRisk,
}

/// Explainable per-metric comparison against the reference baseline.
///
/// Uses the same threshold test as the corresponding risk curve, so a
/// reader can see why a percentage is non-zero independent of the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_value: Option<f64>,
    pub reference_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    pub at_risk: bool,
    #[serde(default)]
    pub insufficient_data: bool,
}

/// Final output of the risk scoring engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResult {
    pub per_leg: PerLegRisk,
    pub overall_risk: u8,
    pub risk_level: RiskLevel,
    /// Keyed by wire metric name (`left_flexion`, `right_abduction`, ...)
    pub deviations: BTreeMap<String, DeviationDetail>,
}
