//! Robustness metrics and the evaluation collaborator contract.
//!
//! The core computes clean and robust accuracy and per-epoch loss means;
//! where those numbers go (files, dashboards, experiment trackers) is the
//! business of whatever implements [`EvalRecorder`].

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Argmax over each logit row. Ties resolve to the lowest class index.
#[must_use]
pub fn argmax_predictions(logits: &Array2<f32>) -> Vec<usize> {
    logits
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (i, &v) in row.iter().enumerate() {
                if v > best_value {
                    best_value = v;
                    best = i;
                }
            }
            best
        })
        .collect()
}

/// Fraction of predictions matching labels. Empty input counts as zero.
#[must_use]
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    if predictions.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels.iter())
        .filter(|(p, l)| p == l)
        .count();
    correct as f32 / predictions.len() as f32
}

/// Collaborator contract for evaluation bookkeeping.
///
/// The trainer calls this once per evaluation pass; storage format and
/// destination are the implementer's choice.
pub trait EvalRecorder {
    /// Records the accuracies measured for one epoch.
    fn record(&mut self, epoch: u64, clean_accuracy: f32, robust_accuracy: f32);
}

/// An [`EvalRecorder`] that keeps everything in memory. Useful for tests
/// and as a default when no external tracker is wired up.
#[derive(Debug, Default, Clone)]
pub struct VecRecorder {
    /// Recorded `(epoch, clean, robust)` rows in call order.
    pub rows: Vec<(u64, f32, f32)>,
}

impl EvalRecorder for VecRecorder {
    fn record(&mut self, epoch: u64, clean_accuracy: f32, robust_accuracy: f32) {
        self.rows.push((epoch, clean_accuracy, robust_accuracy));
    }
}

/// Aggregate numbers for one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Epoch index.
    pub epoch: u64,
    /// Mean loss over trained (non-skipped) batches.
    pub mean_loss: f32,
    /// Mean attack success rate over adversarial batches.
    pub attack_success_rate: f32,
    /// Accuracy on unperturbed evaluation inputs.
    pub clean_accuracy: f32,
    /// Accuracy under the evaluation attack.
    pub robust_accuracy: f32,
    /// Batches trained on this epoch.
    pub batches: usize,
    /// Batches skipped for numerical reasons.
    pub skipped_batches: usize,
}

/// Accumulates per-batch observations into per-epoch reports.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    loss_sum: f64,
    loss_count: usize,
    success_sum: f64,
    success_count: usize,
    skipped: usize,
    history: Vec<EpochReport>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a trained batch and, when it was adversarial, the attack
    /// success rate over it.
    pub fn record_batch(&mut self, loss: f32, attack_success_rate: Option<f32>) {
        self.loss_sum += f64::from(loss);
        self.loss_count += 1;
        if let Some(rate) = attack_success_rate {
            self.success_sum += f64::from(rate);
            self.success_count += 1;
        }
    }

    /// Records a batch skipped for numerical reasons.
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Closes the epoch, producing its report and resetting batch
    /// accumulators.
    pub fn finish_epoch(
        &mut self,
        epoch: u64,
        clean_accuracy: f32,
        robust_accuracy: f32,
    ) -> EpochReport {
        let mean_loss = if self.loss_count == 0 {
            0.0
        } else {
            (self.loss_sum / self.loss_count as f64) as f32
        };
        let attack_success_rate = if self.success_count == 0 {
            0.0
        } else {
            (self.success_sum / self.success_count as f64) as f32
        };
        let report = EpochReport {
            epoch,
            mean_loss,
            attack_success_rate,
            clean_accuracy,
            robust_accuracy,
            batches: self.loss_count,
            skipped_batches: self.skipped,
        };
        self.loss_sum = 0.0;
        self.loss_count = 0;
        self.success_sum = 0.0;
        self.success_count = 0;
        self.skipped = 0;
        self.history.push(report.clone());
        report
    }

    /// All epoch reports so far.
    #[must_use]
    pub fn history(&self) -> &[EpochReport] {
        &self.history
    }

    /// The best robust accuracy seen across epochs.
    #[must_use]
    pub fn best_robust_accuracy(&self) -> f32 {
        self.history
            .iter()
            .map(|r| r.robust_accuracy)
            .fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn argmax_picks_highest_logit() {
        let logits = array![[0.1, 2.0, -1.0], [3.0, 0.0, 0.0]];
        assert_eq!(argmax_predictions(&logits), vec![1, 0]);
    }

    #[test]
    fn argmax_breaks_ties_low() {
        let logits = array![[1.0, 1.0]];
        assert_eq!(argmax_predictions(&logits), vec![0]);
    }

    #[test]
    fn accuracy_counts_matches() {
        assert!((accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]) - 0.75).abs() < 1e-6);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn collector_resets_between_epochs() {
        let mut collector = MetricsCollector::new();
        collector.record_batch(2.0, Some(0.5));
        collector.record_batch(4.0, None);
        collector.record_skip();
        let report = collector.finish_epoch(0, 0.9, 0.6);
        assert!((report.mean_loss - 3.0).abs() < 1e-6);
        assert!((report.attack_success_rate - 0.5).abs() < 1e-6);
        assert_eq!(report.batches, 2);
        assert_eq!(report.skipped_batches, 1);

        let empty = collector.finish_epoch(1, 1.0, 1.0);
        assert_eq!(empty.batches, 0);
        assert_eq!(empty.skipped_batches, 0);
        assert_eq!(collector.history().len(), 2);
        assert!((collector.best_robust_accuracy() - 1.0).abs() < 1e-6);
    }
}
