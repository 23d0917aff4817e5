//! Typed error hierarchy for the Waypoint workflow runner.
//!
//! Three top-level enums cover the three subsystems:
//! - `ExecError`: single agent-invocation failures
//! - `StateError`: workflow state persistence and validation failures
//! - `WorkflowError`: orchestrator-level failures

use thiserror::Error;

/// Errors from a single agent invocation.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Agent binary '{binary}' not found: {source}")]
    LaunchFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Agent exited with non-zero code {code}")]
    NonZeroExit { code: i32 },

    #[error("Circuit breaker tripped: {trigger}")]
    BreakerTripped { trigger: String },

    #[error("Agent finished without emitting the exit signal")]
    MissingExitSignal,
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid feature name '{name}': {reason}")]
    InvalidFeatureName { name: String, reason: String },

    #[error("Failed to persist state at {path}: {source}")]
    PersistFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the orchestrator.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("PRD.md not found in {0}")]
    MissingPrd(std::path::PathBuf),

    #[error("A workflow is already running for this feature")]
    AlreadyRunning,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
