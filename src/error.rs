//! Error handling module for midwife
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Library code returns these types; stage bodies and configuration loading use
//! `anyhow` for context chains and are converted at the engine boundary.

use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::{Phase, StageId};
use crate::store::StoreError;

/// Main error type for midwife
#[derive(Error, Debug)]
pub enum MidwifeError {
    /// Checkpoint store errors (write failures, revision conflicts)
    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage identifier that is not part of the active catalog
    #[error("Stage '{0}' is not part of the pipeline catalog")]
    UnknownStage(String),

    /// Operation requires a checkpoint but none is persisted
    #[error("No checkpoint found at {0}")]
    NoCheckpoint(String),

    /// Intervention that only makes sense while the pipeline is parked
    #[error("Pipeline is not waiting for an operator (stage '{0}')")]
    NotEscalated(Phase),

    /// Nobody resolved a failed stage before the escalation ceiling elapsed
    #[error("Escalation for stage '{stage}' timed out after {}s without operator intervention", waited.as_secs())]
    EscalationTimeout {
        stage: StageId,
        waited: Duration,
        recoverable: bool,
    },

    /// The process received an interrupt while waiting for an operator
    #[error("Interrupted while waiting for operator intervention on stage '{stage}'")]
    Interrupted { stage: StageId },
}

/// Result type alias for midwife operations
pub type Result<T> = std::result::Result<T, MidwifeError>;

impl MidwifeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unknown stage error
    pub fn unknown_stage(name: impl Into<String>) -> Self {
        Self::UnknownStage(name.into())
    }

    /// Process exit code for this error when it ends a pipeline run.
    ///
    /// Interrupts follow the shell convention of `128 + SIGINT`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { .. } => 130,
            _ => 1,
        }
    }
}
