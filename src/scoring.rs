//! Risk scoring engine
//!
//! Pure, stateless conversion of a per-task statistic bundle into per-limb
//! and overall injury-risk percentages against the reference baseline.
//! No I/O, no clocks; everything needed comes in as arguments.
//!
//! The risk model targets the two established jump-landing risk factors:
//! insufficient knee flexion (subject flexes less than the reference) and
//! excess knee abduction (valgus collapse beyond the reference). Each
//! factor maps linearly from its deviation threshold to a saturation
//! deviation, and the worst factor dominates: averaging would dilute a
//! severe single-factor deficiency.

use crate::baseline::ReferenceBaseline;
use crate::error::SessionError;
use crate::types::{
    metric_key, DeviationDetail, Leg, LegRisk, Metric, MetricSummary, PerLegRisk, RiskLevel,
    RiskResult, StatisticBundle,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deviation thresholds for the risk curves (degrees).
///
/// These encode a normative judgment, not physics, so they are
/// configuration rather than constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Flexion deficit below which no risk is attributed
    pub flexion_threshold_deg: f64,
    /// Abduction excess below which no risk is attributed
    pub abduction_threshold_deg: f64,
    /// Deviation at which risk saturates at 100%
    pub max_deviation_deg: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            flexion_threshold_deg: 10.0,
            abduction_threshold_deg: 10.0,
            max_deviation_deg: 30.0,
        }
    }
}

impl RiskThresholds {
    /// Reject threshold sets the risk curve cannot be evaluated against
    pub fn validate(&self) -> Result<(), SessionError> {
        let all_finite = self.flexion_threshold_deg.is_finite()
            && self.abduction_threshold_deg.is_finite()
            && self.max_deviation_deg.is_finite();
        if !all_finite {
            return Err(SessionError::ScoringInput(
                "thresholds must be finite".to_string(),
            ));
        }
        if self.max_deviation_deg <= self.flexion_threshold_deg
            || self.max_deviation_deg <= self.abduction_threshold_deg
        {
            return Err(SessionError::ScoringInput(format!(
                "max deviation {}° must exceed both thresholds",
                self.max_deviation_deg
            )));
        }
        Ok(())
    }

    fn threshold_for(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Flexion => self.flexion_threshold_deg,
            Metric::Abduction => self.abduction_threshold_deg,
        }
    }
}

/// Risk scoring engine
pub struct RiskEngine;

impl RiskEngine {
    /// Score a task's statistic bundle against the reference baseline.
    ///
    /// Missing or non-finite metrics contribute zero risk and are flagged
    /// `insufficient_data` in the deviation detail. A bundle carrying no
    /// metrics at all is structurally invalid and fails loudly.
    pub fn score(
        bundle: &StatisticBundle,
        baseline: &ReferenceBaseline,
        thresholds: &RiskThresholds,
    ) -> Result<RiskResult, SessionError> {
        thresholds.validate()?;

        if !bundle.has_any_metric() {
            return Err(SessionError::ScoringInput(
                "statistic bundle carries no metric summaries".to_string(),
            ));
        }

        let mut deviations = BTreeMap::new();
        let mut leg_risks = [LegRisk {
            flexion_risk: 0,
            abduction_risk: 0,
            overall_risk: 0,
        }; 2];

        for (slot, leg) in [Leg::Left, Leg::Right].into_iter().enumerate() {
            let mut metric_risks = [0u8; 2];

            for (m, metric) in [Metric::Flexion, Metric::Abduction].into_iter().enumerate() {
                let (risk, detail) = score_metric(
                    bundle.metric(leg, metric),
                    baseline.metric(leg, metric),
                    metric,
                    thresholds,
                );
                metric_risks[m] = round_percentage(risk);
                deviations.insert(metric_key(leg, metric), detail);
            }

            leg_risks[slot] = LegRisk {
                flexion_risk: metric_risks[0],
                abduction_risk: metric_risks[1],
                overall_risk: metric_risks[0].max(metric_risks[1]),
            };
        }

        let overall_risk = leg_risks[0].overall_risk.max(leg_risks[1].overall_risk);

        Ok(RiskResult {
            per_leg: PerLegRisk {
                left: leg_risks[0],
                right: leg_risks[1],
            },
            overall_risk,
            risk_level: RiskLevel::from_score(overall_risk as f64),
            deviations,
        })
    }
}

/// Signed deviation in the risk-relevant direction for a metric.
///
/// Flexion risk triggers when the subject flexes *less* than the reference
/// (reference minus user); abduction risk triggers when the subject abducts
/// *more* (user minus reference).
fn risk_deviation(metric: Metric, user_mean: f64, reference_mean: f64) -> f64 {
    match metric {
        Metric::Flexion => reference_mean - user_mean,
        Metric::Abduction => user_mean - reference_mean,
    }
}

/// Linear risk curve: zero through the threshold, then scaled to saturate
/// at 100 once the deviation reaches the configured maximum.
fn scaled_risk(deviation: f64, threshold: f64, max_deviation: f64) -> f64 {
    if deviation <= threshold {
        return 0.0;
    }
    ((deviation - threshold) / (max_deviation - threshold) * 100.0).clamp(0.0, 100.0)
}

fn score_metric(
    user: Option<&MetricSummary>,
    reference: &MetricSummary,
    metric: Metric,
    thresholds: &RiskThresholds,
) -> (f64, DeviationDetail) {
    let threshold = thresholds.threshold_for(metric);

    match user {
        Some(summary) if summary.is_usable() => {
            let deviation = risk_deviation(metric, summary.mean, reference.mean);
            let risk = scaled_risk(deviation, threshold, thresholds.max_deviation_deg);
            let detail = DeviationDetail {
                user_value: Some(summary.mean),
                reference_value: reference.mean,
                deviation: Some(deviation),
                at_risk: deviation > threshold,
                insufficient_data: false,
            };
            (risk, detail)
        }
        _ => {
            let detail = DeviationDetail {
                user_value: None,
                reference_value: reference.mean,
                deviation: None,
                at_risk: false,
                insufficient_data: true,
            };
            (0.0, detail)
        }
    }
}

fn round_percentage(risk: f64) -> u8 {
    risk.clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A user bundle identical to the baseline on every metric
    fn bundle_at_reference(baseline: &ReferenceBaseline) -> StatisticBundle {
        StatisticBundle {
            recording_info: None,
            left_flexion: Some(baseline.left_flexion),
            right_flexion: Some(baseline.right_flexion),
            left_abduction: Some(baseline.left_abduction),
            right_abduction: Some(baseline.right_abduction),
            symmetry_metrics: None,
        }
    }

    #[test]
    fn test_reference_equal_bundle_scores_zero() {
        let baseline = ReferenceBaseline::normative();
        let bundle = bundle_at_reference(&baseline);

        let result = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap();

        assert_eq!(result.overall_risk, 0);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.per_leg.left.overall_risk, 0);
        assert_eq!(result.per_leg.right.overall_risk, 0);
        for detail in result.deviations.values() {
            assert!(!detail.at_risk);
            assert!(!detail.insufficient_data);
        }
    }

    #[test]
    fn test_risk_curve_endpoints() {
        // At the threshold exactly: still zero
        assert_eq!(scaled_risk(10.0, 10.0, 30.0), 0.0);
        // At the saturation deviation: exactly 100
        assert_eq!(scaled_risk(30.0, 10.0, 30.0), 100.0);
        // Beyond saturation: clamped
        assert_eq!(scaled_risk(55.0, 10.0, 30.0), 100.0);
        // Midpoint of the band
        assert_eq!(scaled_risk(20.0, 10.0, 30.0), 50.0);
    }

    #[test]
    fn test_risk_curve_monotonic_beyond_threshold() {
        let mut previous = 0.0;
        let mut deviation = 10.0;
        while deviation <= 40.0 {
            let risk = scaled_risk(deviation, 10.0, 30.0);
            assert!(risk >= previous, "risk decreased at deviation {}", deviation);
            previous = risk;
            deviation += 0.5;
        }
    }

    #[test]
    fn test_leg_overall_is_worst_factor() {
        let baseline = ReferenceBaseline::normative();
        let thresholds = RiskThresholds::default();

        // Sweep (flexion deficit, abduction excess) pairs and check that
        // the per-leg overall always equals the worse component.
        for flexion_deficit in [0.0, 12.0, 18.0, 25.0, 35.0] {
            for abduction_excess in [0.0, 11.0, 16.0, 28.0, 40.0] {
                let mut bundle = bundle_at_reference(&baseline);
                bundle.left_flexion = Some(MetricSummary::from_scalar(
                    baseline.left_flexion.mean - flexion_deficit,
                ));
                bundle.left_abduction = Some(MetricSummary::from_scalar(
                    baseline.left_abduction.mean + abduction_excess,
                ));

                let result = RiskEngine::score(&bundle, &baseline, &thresholds).unwrap();
                let left = result.per_leg.left;
                assert_eq!(
                    left.overall_risk,
                    left.flexion_risk.max(left.abduction_risk)
                );
                assert_eq!(
                    result.overall_risk,
                    left.overall_risk.max(result.per_leg.right.overall_risk)
                );
            }
        }
    }

    #[test]
    fn test_known_flexion_deficit_scenario() {
        // Left flexion mean 23.77° below reference, everything else at
        // reference: risk = round((23.77 - 10) / 20 * 100) = 69, High.
        let baseline = ReferenceBaseline::normative();
        let mut bundle = bundle_at_reference(&baseline);
        bundle.left_flexion = Some(MetricSummary::from_scalar(
            baseline.left_flexion.mean - 23.77,
        ));

        let result = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap();

        assert_eq!(result.per_leg.left.flexion_risk, 69);
        assert_eq!(result.per_leg.left.overall_risk, 69);
        assert_eq!(result.per_leg.right.overall_risk, 0);
        assert_eq!(result.overall_risk, 69);
        assert_eq!(result.risk_level, RiskLevel::High);

        let detail = &result.deviations["left_flexion"];
        assert!(detail.at_risk);
        assert!((detail.deviation.unwrap() - 23.77).abs() < 1e-9);
    }

    #[test]
    fn test_abduction_direction_is_excess() {
        let baseline = ReferenceBaseline::normative();
        let mut bundle = bundle_at_reference(&baseline);
        // Abducting *less* than reference must not create risk
        bundle.right_abduction = Some(MetricSummary::from_scalar(
            baseline.right_abduction.mean - 20.0,
        ));

        let result = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap();
        assert_eq!(result.per_leg.right.abduction_risk, 0);

        // Abducting more than reference does
        bundle.right_abduction = Some(MetricSummary::from_scalar(
            baseline.right_abduction.mean + 20.0,
        ));
        let result = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap();
        assert_eq!(result.per_leg.right.abduction_risk, 50);
        assert!(result.deviations["right_abduction"].at_risk);
    }

    #[test]
    fn test_missing_metric_is_insufficient_data_not_error() {
        let baseline = ReferenceBaseline::normative();
        let mut bundle = bundle_at_reference(&baseline);
        bundle.left_abduction = None;

        let result = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap();

        assert_eq!(result.per_leg.left.abduction_risk, 0);
        let detail = &result.deviations["left_abduction"];
        assert!(detail.insufficient_data);
        assert!(detail.user_value.is_none());
        assert!(!detail.at_risk);
    }

    #[test]
    fn test_non_finite_metric_is_insufficient_data() {
        let baseline = ReferenceBaseline::normative();
        let mut bundle = bundle_at_reference(&baseline);
        bundle.right_flexion = Some(MetricSummary::from_scalar(f64::NAN));

        let result = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap();

        assert_eq!(result.per_leg.right.flexion_risk, 0);
        assert!(result.deviations["right_flexion"].insufficient_data);
    }

    #[test]
    fn test_empty_bundle_fails_loudly() {
        let baseline = ReferenceBaseline::normative();
        let bundle = StatisticBundle::default();

        let err = RiskEngine::score(&bundle, &baseline, &RiskThresholds::default()).unwrap_err();
        assert!(matches!(err, SessionError::ScoringInput(_)));
    }

    #[test]
    fn test_degenerate_thresholds_rejected() {
        let thresholds = RiskThresholds {
            flexion_threshold_deg: 10.0,
            abduction_threshold_deg: 10.0,
            max_deviation_deg: 10.0,
        };
        assert!(thresholds.validate().is_err());

        let baseline = ReferenceBaseline::normative();
        let bundle = bundle_at_reference(&baseline);
        assert!(RiskEngine::score(&bundle, &baseline, &thresholds).is_err());
    }

    #[test]
    fn test_legacy_payload_scores_through_canonical_path() {
        let baseline = ReferenceBaseline::normative();
        let legacy = crate::types::LegacyTaskResult {
            left_knee_flexion: baseline.left_flexion.mean - 23.77,
            left_knee_valgus: baseline.left_abduction.mean,
            left_knee_risk: 12.0, // ignored: the engine rescoring is authoritative
            right_knee_flexion: baseline.right_flexion.mean,
            right_knee_valgus: baseline.right_abduction.mean,
            right_knee_risk: 0.0,
        };

        let result =
            RiskEngine::score(&legacy.into_bundle(), &baseline, &RiskThresholds::default())
                .unwrap();
        assert_eq!(result.per_leg.left.flexion_risk, 69);
        assert_eq!(result.risk_level, RiskLevel::High);
    }
}
