//! Error types for adversarial training.
//!
//! The taxonomy separates errors that must fail fast at construction time
//! (invalid constraints, unknown attack strategies) from errors that are
//! contained and recovered at batch or round granularity (numerical
//! instability, worker timeouts). Only configuration errors and
//! threshold-exceeding runtime errors terminate a run.

use thiserror::Error;

/// Result type alias for adversarial training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Errors that can occur during attack generation, training, or coordination.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Invalid configuration parameter. Raised at construction, never
    /// mid-batch.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The requested attack strategy id is not registered.
    #[error("unknown attack strategy: {0:?}")]
    UnknownStrategy(String),

    /// NaN or infinity in a loss or gradient. Recovered at batch
    /// granularity until the consecutive-failure threshold is exceeded.
    #[error("numerical instability at step {step}: {detail}")]
    Numerical {
        /// What went non-finite, with batch context.
        detail: String,
        /// Training step at which the instability was observed.
        step: u64,
    },

    /// A coordination round failed (quorum not reached, worker timeout,
    /// leader gone). Retried up to a bounded count, then fatal.
    #[error("coordination failure in round {round}: {reason}")]
    Coordination {
        /// Round number the failure occurred in.
        round: u64,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Checkpoint save or load failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A model collaborator reported a failure.
    #[error("model error: {0}")]
    Model(String),
}

impl TrainError {
    /// Returns whether the error terminates the run or is containable at
    /// batch/round granularity.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrainError::Config(_) | TrainError::UnknownStrategy(_) | TrainError::ShapeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_fatal() {
        assert!(TrainError::Config("radius".into()).is_fatal());
        assert!(TrainError::UnknownStrategy("boundary".into()).is_fatal());
    }

    #[test]
    fn batch_level_errors_are_not_fatal() {
        let err = TrainError::Numerical {
            detail: "nan loss".into(),
            step: 7,
        };
        assert!(!err.is_fatal());
    }
}
