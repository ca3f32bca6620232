//! Numerical stability monitoring.
//!
//! A single NaN loss is containable: the batch is skipped and the
//! optimizer left untouched. A run of them means the model is already
//! poisoned, and continuing would silently train on garbage; the
//! monitor escalates to a fatal [`TrainError::Numerical`] once the
//! consecutive-failure threshold is reached.

use ndarray::ArrayD;
use tracing::warn;

use crate::error::{Result, TrainError};

/// Verdict on a single observed batch loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerdict {
    /// Finite loss; train on the batch.
    Healthy,
    /// Non-finite loss; skip the batch, no optimizer step.
    Skip,
}

/// Tracks consecutive non-finite losses and escalates past a threshold.
#[derive(Debug, Clone)]
pub struct StabilityMonitor {
    threshold: usize,
    consecutive: usize,
    total_failures: u64,
}

impl StabilityMonitor {
    /// Monitor that escalates after `threshold` consecutive failures.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            total_failures: 0,
        }
    }

    /// Observes one batch loss.
    ///
    /// # Errors
    ///
    /// [`TrainError::Numerical`] once the consecutive-failure threshold
    /// is reached.
    pub fn observe(&mut self, loss: f32, step: u64) -> Result<BatchVerdict> {
        if loss.is_finite() {
            self.consecutive = 0;
            return Ok(BatchVerdict::Healthy);
        }
        self.consecutive += 1;
        self.total_failures += 1;
        warn!(
            step,
            consecutive = self.consecutive,
            "non-finite loss observed, skipping batch"
        );
        if self.consecutive >= self.threshold {
            return Err(TrainError::Numerical {
                detail: format!(
                    "{} consecutive non-finite losses (threshold {})",
                    self.consecutive, self.threshold
                ),
                step,
            });
        }
        Ok(BatchVerdict::Skip)
    }

    /// Total non-finite losses seen over the monitor's lifetime.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Current run of consecutive failures.
    #[must_use]
    pub fn consecutive_failures(&self) -> usize {
        self.consecutive
    }
}

/// Returns whether every element of every tensor is finite.
#[must_use]
pub fn all_finite(tensors: &[ArrayD<f32>]) -> bool {
    tensors
        .iter()
        .all(|t| t.iter().all(|v| v.is_finite()))
}
