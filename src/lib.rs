//! Kinetia Assess - session coordination and injury-risk scoring for
//! sensor-guided movement assessments
//!
//! The crate drives a multi-step biomechanical self-assessment against an
//! external sensor-processing service: a subject performs standing
//! calibration, flexion calibration and a jump-landing task while the
//! service streams status over a WebSocket and delivers per-task
//! statistic bundles. The final bundle is scored against a normative
//! reference baseline into per-leg and overall injury-risk percentages.
//!
//! ## Modules
//!
//! - **Session**: deterministic state machine sequencing the configured
//!   steps and reconciling channel events with local countdowns
//! - **Scoring**: pure risk engine mapping statistic bundles + baseline to
//!   risk percentages, bands and deviation explanations
//! - **Connection**: supervised WebSocket channel with single-retry
//!   reconnect
//! - **Coordinator**: async driver tying the three together

pub mod baseline;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod scoring;
pub mod session;
pub mod types;

pub use baseline::{ReferenceBaseline, BASELINE_VERSION};
pub use config::{AdvanceMode, RequiredSignal, SessionConfig, StepDescriptor};
pub use connection::{ChannelEvent, ConnectionConfig, ConnectionManager, LinkStatus};
pub use coordinator::SessionCoordinator;
pub use error::SessionError;
pub use protocol::{ClientCommand, CompletionSignal, Envelope, ServiceEvent};
pub use scoring::{RiskEngine, RiskThresholds};
pub use session::{SessionMachine, SessionPhase, SessionSnapshot, StepStatus, Waiting};
pub use types::{RiskLevel, RiskResult, StatisticBundle, TaskResultPayload};

/// Crate version embedded in reports and diagnostics
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
