//! Channel protocol
//!
//! Wire schema for the duplex channel to the sensor-processing service.
//! Every message travels in a `{type, payload, timestamp?}` envelope;
//! commands and events are exhaustive tagged unions, so adding a message
//! type is a compile-time-checked change rather than a string-switch edit.

use crate::error::SessionError;
use crate::types::{Leg, TaskResultPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message envelope carried on the channel in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<M> {
    #[serde(flatten)]
    pub message: M,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl<M> Envelope<M> {
    /// Wrap an outgoing message, stamping it with the current time
    pub fn stamped(message: M) -> Self {
        Self {
            message,
            timestamp: Some(Utc::now()),
        }
    }
}

/// Commands issued to the sensor service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    StartCalibration {},
    StartFlexionCalibration {},
    StartTask {
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leg: Option<Leg>,
    },
}

impl ClientCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::StartCalibration {} => "start_calibration",
            ClientCommand::StartFlexionCalibration {} => "start_flexion_calibration",
            ClientCommand::StartTask { .. } => "start_task",
        }
    }
}

/// Phase marker inside status payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Running,
    Complete,
}

/// Status payload for calibration and task phases.
///
/// The service is loose here: some builds send `{status, message}`, some
/// send `{elapsed, duration}` ticks under the same types, so every field
/// is optional and readers ask for what they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl PhaseStatus {
    pub fn is_complete(&self) -> bool {
        self.status == Some(Phase::Complete)
    }
}

/// Progress tick payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressTick {
    pub elapsed: f64,
    pub duration: f64,
}

/// Events delivered by the sensor service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServiceEvent {
    PostureStatus {
        upright: bool,
    },
    CalibrationStatus(PhaseStatus),
    FlexionCalibrationStatus(PhaseStatus),
    Progress(ProgressTick),
    CalibrationDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskStatus(PhaseStatus),
    TaskProgress(ProgressTick),
    TaskResult(TaskResultPayload),
    Error {
        message: String,
    },
}

/// Step-completion signals extractable from service events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    CalibrationComplete,
    FlexionCalibrationComplete,
    TaskResult,
}

impl ServiceEvent {
    /// The completion signal this event represents, if any.
    ///
    /// `calibration_done` and a `flexion_calibration_status` with
    /// `status: complete` both mark the end of the flexion phase; older
    /// service builds emit one, newer builds the other.
    pub fn completion(&self) -> Option<CompletionSignal> {
        match self {
            ServiceEvent::CalibrationStatus(status) if status.is_complete() => {
                Some(CompletionSignal::CalibrationComplete)
            }
            ServiceEvent::FlexionCalibrationStatus(status) if status.is_complete() => {
                Some(CompletionSignal::FlexionCalibrationComplete)
            }
            ServiceEvent::CalibrationDone { .. } => {
                Some(CompletionSignal::FlexionCalibrationComplete)
            }
            ServiceEvent::TaskResult(_) => Some(CompletionSignal::TaskResult),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::PostureStatus { .. } => "posture_status",
            ServiceEvent::CalibrationStatus(_) => "calibration_status",
            ServiceEvent::FlexionCalibrationStatus(_) => "flexion_calibration_status",
            ServiceEvent::Progress(_) => "progress",
            ServiceEvent::CalibrationDone { .. } => "calibration_done",
            ServiceEvent::TaskStatus(_) => "task_status",
            ServiceEvent::TaskProgress(_) => "task_progress",
            ServiceEvent::TaskResult(_) => "task_result",
            ServiceEvent::Error { .. } => "error",
        }
    }
}

/// Parse one inbound channel frame.
///
/// A frame that does not match any known envelope is a protocol violation;
/// callers log and drop it, the session continues.
pub fn parse_service_envelope(text: &str) -> Result<Envelope<ServiceEvent>, SessionError> {
    serde_json::from_str(text).map_err(|e| SessionError::Protocol(e.to_string()))
}

/// Encode an outbound command as a stamped envelope frame
pub fn encode_command(command: ClientCommand) -> Result<String, SessionError> {
    Ok(serde_json::to_string(&Envelope::stamped(command))?)
}
