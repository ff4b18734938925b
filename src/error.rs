//! Custom error types for the sequencer.
//!
//! This module defines the primary error type, `SequencerError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur while validating and running an
//! observing block.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: Malformed or missing observing block fields, incompatible
//!   template versions, or action arguments that fail a precondition. Raised before
//!   any device mutation and never needs cleanup.
//! - **`DestinationTimeout`**: A postcondition poll did not see the expected value
//!   within its bound. Carries the expected and the last observed value.
//! - **`Cancelled`**: Operator-requested stop. Not a fault; never alerted.
//! - **`StepFailure`**: Any other failure during the execute phase, wrapping the root
//!   cause together with the step it came from (the "unrecoverable step failure").
//! - **`LockHeld`**: The execution lock is already held by another script.
//! - **`Bus`**: The device bus rejected a read or write.
//! - **`DetectorFault`**: A detector reported an error mid exposure. The orchestrator
//!   consumes this to drive its one-shot recovery; it only escapes wrapped in a
//!   `StepFailure`.
//! - **`Config`** / **`Io`**: Configuration loading and file access.
//! - **`CleanupFailed`**: One or more cleanup actions failed.
//!
//! `FailureKind` classifies any error into the four categories that matter to the
//! orchestrator and the alert sink.

use crate::ob::StepRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the sequencer error type.
pub type SequencerResult<T> = std::result::Result<T, SequencerError>;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out after {timeout:?} waiting for {point} to reach {expected} (actual: {actual})")]
    DestinationTimeout {
        point: String,
        expected: String,
        actual: String,
        timeout: Duration,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Step {step} failed: {source}")]
    StepFailure {
        step: StepRef,
        #[source]
        source: Box<SequencerError>,
    },

    #[error("Execution lock is held by {holder}")]
    LockHeld { holder: String },

    #[error("Bus error on {point}: {message}")]
    Bus { point: String, message: String },

    #[error("Detector fault on {detector}")]
    DetectorFault { detector: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cleanup failed with {} error(s)", .0.len())]
    CleanupFailed(Vec<SequencerError>),
}

impl SequencerError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        SequencerError::Validation(message.into())
    }

    /// Shorthand for a bus error.
    pub fn bus(point: impl Into<String>, message: impl fmt::Display) -> Self {
        SequencerError::Bus {
            point: point.into(),
            message: message.to_string(),
        }
    }

    /// Wrap this error as the unrecoverable failure of `step`.
    ///
    /// Destination timeouts, cancellations and existing step failures pass
    /// through unchanged. Everything else, validation errors included, is wrapped.
    pub fn in_step(self, step: StepRef) -> Self {
        match self {
            e @ (SequencerError::StepFailure { .. }
            | SequencerError::Cancelled(_)
            | SequencerError::DestinationTimeout { .. }) => e,
            other => SequencerError::StepFailure {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            SequencerError::Validation(_) | SequencerError::Config(_) => FailureKind::Validation,
            SequencerError::DestinationTimeout { .. } => FailureKind::DestinationTimeout,
            SequencerError::Cancelled(_) => FailureKind::Cancellation,
            SequencerError::LockHeld { .. } => FailureKind::LockHeld,
            _ => FailureKind::UnrecoverableStepFailure,
        }
    }

    /// Expected/actual pair for postcondition mismatches.
    pub fn mismatch(&self) -> Option<(&str, &str)> {
        match self {
            SequencerError::DestinationTimeout {
                expected, actual, ..
            } => Some((expected.as_str(), actual.as_str())),
            SequencerError::StepFailure { source, .. } => source.mismatch(),
            _ => None,
        }
    }
}

/// Classification of failures as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    DestinationTimeout,
    Cancellation,
    UnrecoverableStepFailure,
    LockHeld,
}

impl FailureKind {
    /// Whether a failure of this kind is handed to the alert sink.
    pub fn is_alertable(self) -> bool {
        matches!(
            self,
            FailureKind::DestinationTimeout | FailureKind::UnrecoverableStepFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "ValidationError",
            FailureKind::DestinationTimeout => "DestinationTimeout",
            FailureKind::Cancellation => "CancellationSignal",
            FailureKind::UnrecoverableStepFailure => "UnrecoverableStepFailure",
            FailureKind::LockHeld => "LockHeld",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
