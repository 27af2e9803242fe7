//! Error types for the assessment coordinator

use thiserror::Error;

/// Errors that can occur while coordinating or scoring an assessment
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Channel connectivity: {0}")]
    Connectivity(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid scoring input: {0}")]
    ScoringInput(String),

    #[error("Stale or duplicate signal: {0}")]
    Sequencing(String),

    #[error("Operation not allowed in the current state: {0}")]
    NotAllowed(String),

    #[error("Invalid step configuration: {0}")]
    InvalidConfig(String),
}
