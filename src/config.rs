//! Session configuration
//!
//! The coordinator is parameterized entirely by an ordered table of step
//! descriptors; step count and step identity never appear in the
//! transition logic. The built-in table mirrors the three-phase
//! jump-landing screen the sensor service implements.

use crate::error::SessionError;
use crate::protocol::{ClientCommand, CompletionSignal};
use crate::scoring::RiskThresholds;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default delay before the single reconnect attempt after an unclean close
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 4;

/// How a step leaves the `Running` state once its countdown ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceMode {
    /// Wait for the required external signal; timer expiry alone never
    /// advances (protects against slow backends).
    AutoOnSignal,
    /// Countdown reaching zero stops the timer and surfaces a prompt; the
    /// user explicitly starts the next step.
    ManualPromptAfterTimer,
}

/// What counts as completing a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredSignal {
    /// The local countdown itself completes the step
    Timer,
    /// A matching service event completes the step
    Event(CompletionSignal),
}

/// One entry of the step configuration table. Immutable per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    pub title: String,
    pub instruction: String,
    pub nominal_duration_secs: u64,
    pub command: ClientCommand,
    pub required_signal: RequiredSignal,
    pub advance_mode: AdvanceMode,
    /// Continuous seconds the subject must be upright before an arrived
    /// completion signal is honored. `None` means posture never gates
    /// advancement for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upright_hold_secs: Option<u64>,
    /// Whether this step's task result feeds the risk scoring engine
    #[serde(default)]
    pub scored: bool,
}

/// Full configuration of one assessment session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub steps: Vec<StepDescriptor>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub thresholds: RiskThresholds,
}

fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

impl SessionConfig {
    /// The standard three-phase jump-landing screen: standing calibration,
    /// flexion calibration, then the scored jump-landing task. Each phase
    /// runs ten seconds on the service side and advances on the service's
    /// completion signal.
    pub fn jump_landing() -> Self {
        Self {
            steps: vec![
                StepDescriptor {
                    id: "standing_calibration".to_string(),
                    title: "Standing calibration".to_string(),
                    instruction: "Stand still with your feet shoulder-width apart.".to_string(),
                    nominal_duration_secs: 10,
                    command: ClientCommand::StartCalibration {},
                    required_signal: RequiredSignal::Event(CompletionSignal::CalibrationComplete),
                    advance_mode: AdvanceMode::AutoOnSignal,
                    upright_hold_secs: None,
                    scored: false,
                },
                StepDescriptor {
                    id: "flexion_calibration".to_string(),
                    title: "Flexion calibration".to_string(),
                    instruction: "Perform slow, controlled squats.".to_string(),
                    nominal_duration_secs: 10,
                    command: ClientCommand::StartFlexionCalibration {},
                    required_signal: RequiredSignal::Event(
                        CompletionSignal::FlexionCalibrationComplete,
                    ),
                    advance_mode: AdvanceMode::AutoOnSignal,
                    upright_hold_secs: None,
                    scored: false,
                },
                StepDescriptor {
                    id: "jump_landing".to_string(),
                    title: "Jump landing".to_string(),
                    instruction: "Jump off the box and land on both feet.".to_string(),
                    nominal_duration_secs: 10,
                    command: ClientCommand::StartTask {
                        task: "jump_landing".to_string(),
                        leg: None,
                    },
                    required_signal: RequiredSignal::Event(CompletionSignal::TaskResult),
                    advance_mode: AdvanceMode::AutoOnSignal,
                    upright_hold_secs: None,
                    scored: true,
                },
            ],
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            thresholds: RiskThresholds::default(),
        }
    }

    /// Load a session configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tables the coordinator cannot run
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.steps.is_empty() {
            return Err(SessionError::InvalidConfig(
                "step table is empty".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.nominal_duration_secs == 0 {
                return Err(SessionError::InvalidConfig(format!(
                    "step '{}' has a zero duration",
                    step.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(SessionError::InvalidConfig(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let scored: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.scored)
            .map(|(i, _)| i)
            .collect();
        if scored.len() > 1 {
            return Err(SessionError::InvalidConfig(
                "at most one step may be scored".to_string(),
            ));
        }
        if let Some(&index) = scored.first() {
            if index != self.steps.len() - 1 {
                return Err(SessionError::InvalidConfig(
                    "the scored step must be the final step".to_string(),
                ));
            }
        }

        self.thresholds.validate()?;
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::jump_landing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_jump_landing_template() {
        let config = SessionConfig::jump_landing();
        config.validate().unwrap();

        assert_eq!(config.steps.len(), 3);
        assert_eq!(config.steps[0].id, "standing_calibration");
        assert!(config.steps[2].scored);
        assert_eq!(
            config.steps[2].required_signal,
            RequiredSignal::Event(CompletionSignal::TaskResult)
        );
        assert_eq!(config.reconnect_delay_secs, DEFAULT_RECONNECT_DELAY_SECS);
    }

    #[test]
    fn test_json_round_trip() {
        let config = SessionConfig::jump_landing();
        let json = serde_json::to_string(&config).unwrap();
        let loaded = SessionConfig::from_json(&json).unwrap();
        assert_eq!(loaded.steps.len(), config.steps.len());
        assert_eq!(loaded.steps[2].id, "jump_landing");
    }

    #[test]
    fn test_empty_table_rejected() {
        let config = SessionConfig {
            steps: vec![],
            reconnect_delay_secs: 4,
            thresholds: RiskThresholds::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = SessionConfig::jump_landing();
        let id = config.steps[0].id.clone();
        config.steps[1].id = id;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scored_step_must_be_last() {
        let mut config = SessionConfig::jump_landing();
        config.steps[0].scored = true;
        config.steps[2].scored = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut config = SessionConfig::jump_landing();
        config.steps[1].nominal_duration_secs = 0;
        assert!(config.validate().is_err());
    }
}
