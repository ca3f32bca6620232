//! The adversarial training loop.
//!
//! Per epoch the trainer walks an explicit state machine:
//!
//! ```text
//! Idle → FetchingBatch → [Perturbing] → ComputingLoss → Stepping → Idle
//! ```
//!
//! repeated until the epoch's batches are exhausted, then `Evaluating`
//! once at the boundary. The mixing policy decides per batch whether the
//! `Perturbing` stage runs; the loss combines clean and robust
//! cross-entropy per the configured weights. Attack-internal gradients
//! never reach the optimizer: the engine's perturbation output is the
//! only thing that crosses back, and the step gradient is recomputed
//! from the (possibly adversarial) batch.
//!
//! A NaN loss skips the batch; three consecutive NaN batches abort the
//! run with the last successful checkpoint reference preserved in the
//! log and retrievable via
//! [`AdversarialTrainer::last_checkpoint`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::checkpoint::{CheckpointManager, TrainCheckpoint};
use crate::config::{BatchMix, TrainerConfig};
use crate::data::{Batch, DataSource};
use crate::engine::AttackEngine;
use crate::error::Result;
use crate::metrics::{argmax_predictions, EpochReport, EvalRecorder, MetricsCollector};
use crate::stability::{all_finite, BatchVerdict, StabilityMonitor};
use crate::{Model, Optimizer, OptimizerState};

/// Training progress owned exclusively by the trainer.
///
/// The coordinator reads and broadcasts this but never mutates it except
/// to overwrite a stale copy wholesale on resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    /// Completed epochs.
    pub epoch: u64,
    /// Optimizer steps applied (skipped batches do not count).
    pub step: u64,
    /// Optimizer internals at the last sync point.
    pub optimizer_state: OptimizerState,
    /// Best robust accuracy seen at any evaluation.
    pub best_robust_accuracy: f32,
}

impl TrainState {
    /// Fresh state at epoch 0, step 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: 0,
            step: 0,
            optimizer_state: OptimizerState::default(),
            best_robust_accuracy: 0.0,
        }
    }
}

impl Default for TrainState {
    fn default() -> Self {
        Self::new()
    }
}

/// Weighted combination of clean and robust cross-entropy.
///
/// The attack engine's internal gradients are already discarded by the
/// time this runs; the step gradient is recomputed from the clean and
/// adversarial inputs under the configured weighting. Shared by the
/// trainer and by coordinator workers, which compute the same combined
/// gradient on their shards without stepping locally.
pub(crate) fn combine_losses(
    model: &dyn Model,
    batch: &Batch,
    attack: Option<&crate::engine::AttackOutcome>,
    clean_weight: f32,
    robust_weight: f32,
) -> Result<(f32, Vec<ndarray::ArrayD<f32>>, Option<f32>)> {
    match attack {
        Some(outcome) => {
            let (robust_loss, robust_grads) =
                model.loss_and_gradients(&outcome.adversarial, &batch.labels)?;
            if clean_weight > 0.0 {
                let (clean_loss, clean_grads) =
                    model.loss_and_gradients(&batch.inputs, &batch.labels)?;
                let loss = clean_weight * clean_loss + robust_weight * robust_loss;
                let grads = clean_grads
                    .into_iter()
                    .zip(robust_grads)
                    .map(|(c, r)| c * clean_weight + r * robust_weight)
                    .collect();
                Ok((loss, grads, Some(outcome.success_rate)))
            } else {
                let grads = robust_grads.into_iter().map(|g| g * robust_weight).collect();
                Ok((
                    robust_weight * robust_loss,
                    grads,
                    Some(outcome.success_rate),
                ))
            }
        }
        None => {
            let (loss, grads) = model.loss_and_gradients(&batch.inputs, &batch.labels)?;
            Ok((loss, grads, None))
        }
    }
}

/// Stages of the per-batch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    /// Between batches.
    Idle,
    /// Pulling the next batch from the data source.
    FetchingBatch,
    /// Running the attack engine on the batch.
    Perturbing,
    /// Computing the combined loss and gradients.
    ComputingLoss,
    /// Applying the optimizer step.
    Stepping,
    /// Epoch-boundary evaluation.
    Evaluating,
}

/// What happened to one training batch.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Combined loss (NaN when the batch was skipped).
    pub loss: f32,
    /// Whether the batch was perturbed before the loss pass.
    pub adversarial: bool,
    /// Attack success rate over the batch, when adversarial.
    pub attack_success_rate: Option<f32>,
    /// Whether the batch was skipped for numerical reasons.
    pub skipped: bool,
}

/// Orchestrates adversarial training over a model/optimizer pair.
///
/// Model and optimizer live behind `parking_lot` mutexes so worker
/// threads in distributed runs can share the storage pattern; within one
/// trainer, attack generation and loss computation are sequential.
pub struct AdversarialTrainer<M, O> {
    model: Arc<Mutex<M>>,
    optimizer: Arc<Mutex<O>>,
    config: TrainerConfig,
    engine: AttackEngine,
    eval_engine: AttackEngine,
    state: TrainState,
    phase: TrainerPhase,
    stability: StabilityMonitor,
    metrics: MetricsCollector,
    mix_rng: ChaCha8Rng,
    batch_index: u64,
    checkpoint_manager: Option<CheckpointManager>,
    last_checkpoint: Option<PathBuf>,
}

impl<M: Model, O: Optimizer> AdversarialTrainer<M, O> {
    /// Creates a trainer, validating the configuration and resolving both
    /// attack engines up front.
    pub fn new(model: M, optimizer: O, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let engine = AttackEngine::new(config.attack.clone(), config.seed)?;
        let eval_engine =
            AttackEngine::new(config.eval_attack().clone(), config.seed.wrapping_add(1))?;
        let mix_rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(2));
        let stability = StabilityMonitor::new(config.nan_escalation);
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            optimizer: Arc::new(Mutex::new(optimizer)),
            config,
            engine,
            eval_engine,
            state: TrainState::new(),
            phase: TrainerPhase::Idle,
            stability,
            metrics: MetricsCollector::new(),
            mix_rng,
            batch_index: 0,
            checkpoint_manager: None,
            last_checkpoint: None,
        })
    }

    /// Enables checkpoint writes under `directory` per the configured
    /// [`CheckpointPolicy`](crate::config::CheckpointPolicy).
    pub fn enable_checkpointing<P: Into<PathBuf>>(&mut self, directory: P) -> Result<()> {
        self.checkpoint_manager = Some(CheckpointManager::new(
            directory,
            self.config.checkpoint.clone(),
        )?);
        Ok(())
    }

    /// Current state-machine phase.
    #[must_use]
    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Current training state.
    #[must_use]
    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// The trainer's configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Most recent successfully written checkpoint.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<&Path> {
        self.last_checkpoint.as_deref()
    }

    /// Locks and returns the model guard (for inspection or evaluation).
    pub fn model(&self) -> parking_lot::MutexGuard<'_, M> {
        self.model.lock()
    }

    fn next_batch_is_adversarial(&mut self) -> bool {
        match self.config.mix {
            BatchMix::Always => true,
            BatchMix::Alternate => self.batch_index % 2 == 0,
            BatchMix::Probability(p) => self.mix_rng.gen::<f32>() < p,
        }
    }

    /// Executes one training batch through the state machine.
    ///
    /// # Errors
    ///
    /// Propagates fatal errors: configuration problems and the
    /// consecutive-NaN escalation from the stability monitor. A single
    /// non-finite loss is contained: the batch is skipped and the
    /// outcome marked accordingly.
    pub fn step(&mut self, batch: &Batch) -> Result<StepOutcome> {
        self.phase = TrainerPhase::FetchingBatch;
        let adversarial = self.next_batch_is_adversarial();
        self.batch_index += 1;

        let mut model = self.model.lock();

        let attack_outcome = if adversarial {
            self.phase = TrainerPhase::Perturbing;
            Some(self.engine.perturb(&mut *model, batch)?)
        } else {
            None
        };

        self.phase = TrainerPhase::ComputingLoss;
        let (loss, grads, success_rate) = combine_losses(
            &*model,
            batch,
            attack_outcome.as_ref(),
            self.config.clean_weight,
            self.config.robust_weight,
        )?;

        let observed = if loss.is_finite() && !all_finite(&grads) {
            // Finite loss but poisoned gradients still counts as a
            // numerical failure for escalation purposes.
            f32::NAN
        } else {
            loss
        };
        match self.stability.observe(observed, self.state.step)? {
            BatchVerdict::Skip => {
                drop(model);
                self.metrics.record_skip();
                self.phase = TrainerPhase::Idle;
                return Ok(StepOutcome {
                    loss,
                    adversarial,
                    attack_success_rate: success_rate,
                    skipped: true,
                });
            }
            BatchVerdict::Healthy => {}
        }

        self.phase = TrainerPhase::Stepping;
        let mut params = model.parameters();
        let mut optimizer = self.optimizer.lock();
        optimizer.step(&mut params, &grads)?;
        drop(optimizer);
        model.set_parameters(&params)?;
        drop(model);

        self.state.step += 1;
        self.metrics.record_batch(loss, success_rate);
        debug!(
            step = self.state.step,
            loss,
            adversarial,
            "batch trained"
        );

        self.phase = TrainerPhase::Idle;
        Ok(StepOutcome {
            loss,
            adversarial,
            attack_success_rate: success_rate,
            skipped: false,
        })
    }

    /// Measures clean and robust accuracy over a data source without
    /// touching the optimizer.
    pub fn evaluate(&mut self, data: &dyn DataSource, epoch: u64) -> Result<(f32, f32)> {
        self.phase = TrainerPhase::Evaluating;
        let mut model = self.model.lock();
        let mut clean_correct = 0usize;
        let mut robust_correct = 0usize;
        let mut total = 0usize;
        for batch in data.epoch_batches(epoch) {
            let clean_logits = model.forward(&batch.inputs)?;
            let clean_predictions = argmax_predictions(&clean_logits);
            clean_correct += clean_predictions
                .iter()
                .zip(batch.labels.iter())
                .filter(|(p, l)| p == l)
                .count();

            let outcome = self.eval_engine.perturb(&mut *model, &batch)?;
            robust_correct += outcome
                .predictions
                .iter()
                .zip(batch.labels.iter())
                .filter(|(p, l)| p == l)
                .count();
            total += batch.len();
        }
        drop(model);
        self.phase = TrainerPhase::Idle;
        if total == 0 {
            return Ok((0.0, 0.0));
        }
        Ok((
            clean_correct as f32 / total as f32,
            robust_correct as f32 / total as f32,
        ))
    }

    /// Runs one full epoch: every batch through [`AdversarialTrainer::step`],
    /// then an evaluation pass on the same source, recording accuracies
    /// with the collaborator and checkpointing per policy.
    pub fn run_epoch(
        &mut self,
        data: &dyn DataSource,
        recorder: &mut dyn EvalRecorder,
    ) -> Result<EpochReport> {
        let epoch = self.state.epoch;
        let result = self.run_epoch_inner(data, recorder, epoch);
        if let Err(err) = &result {
            error!(
                epoch,
                kind = %err,
                last_checkpoint = ?self.last_checkpoint,
                "training aborted"
            );
        }
        result
    }

    fn run_epoch_inner(
        &mut self,
        data: &dyn DataSource,
        recorder: &mut dyn EvalRecorder,
        epoch: u64,
    ) -> Result<EpochReport> {
        for batch in data.epoch_batches(epoch) {
            self.step(&batch)?;
        }

        let (clean_accuracy, robust_accuracy) = self.evaluate(data, epoch)?;
        recorder.record(epoch, clean_accuracy, robust_accuracy);
        let report = self.metrics.finish_epoch(epoch, clean_accuracy, robust_accuracy);
        if robust_accuracy > self.state.best_robust_accuracy {
            self.state.best_robust_accuracy = robust_accuracy;
        }
        info!(
            epoch,
            mean_loss = report.mean_loss,
            clean_accuracy,
            robust_accuracy,
            skipped = report.skipped_batches,
            "epoch complete"
        );

        self.state.epoch = epoch + 1;

        let should_save = self
            .checkpoint_manager
            .as_ref()
            .map_or(false, |mgr| mgr.should_save(epoch));
        if should_save {
            let checkpoint = self.checkpoint_state();
            if let Some(manager) = self.checkpoint_manager.as_mut() {
                match manager.save(&checkpoint, epoch) {
                    Ok(path) => self.last_checkpoint = Some(path),
                    // A failed save must not kill the run.
                    Err(err) => error!(epoch, %err, "checkpoint save failed"),
                }
            }
        }

        Ok(report)
    }

    /// Snapshot of everything needed to resume: parameters, optimizer
    /// state, epoch/step counters. Contract for the external persistence
    /// layer.
    #[must_use]
    pub fn checkpoint_state(&self) -> TrainCheckpoint {
        let mut state = self.state.clone();
        state.optimizer_state = self.optimizer.lock().state();
        TrainCheckpoint::new(self.model.lock().parameters(), state)
    }

    /// Reconstructs trainer, model, and optimizer state from a snapshot.
    pub fn restore_state(&mut self, checkpoint: &TrainCheckpoint) -> Result<()> {
        self.model.lock().set_parameters(&checkpoint.params)?;
        self.optimizer
            .lock()
            .restore(&checkpoint.state.optimizer_state)?;
        self.state = checkpoint.state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttackConfig;
    use crate::constraint::{ConstraintSpec, NormKind};
    use crate::data::InMemoryDataset;
    use crate::metrics::VecRecorder;
    use crate::models::{LinearClassifier, Sgd};
    use ndarray::ArrayD;

    fn dataset() -> InMemoryDataset {
        let inputs = ArrayD::from_shape_vec(
            vec![4, 2],
            vec![1.0, 0.0, 1.2, 0.1, -1.0, 0.0, -1.2, -0.1],
        )
        .unwrap();
        InMemoryDataset::new(inputs, vec![1, 1, 0, 0], 2).unwrap()
    }

    fn trainer(mix: BatchMix) -> AdversarialTrainer<LinearClassifier, Sgd> {
        let constraint = ConstraintSpec::new(NormKind::Linf, 0.1, (-5.0, 5.0)).unwrap();
        let config = TrainerConfig::builder()
            .attack(AttackConfig::pgd(constraint, 0.05, 3))
            .mix(mix)
            .build();
        AdversarialTrainer::new(LinearClassifier::new(2, 2), Sgd::new(0.5), config).unwrap()
    }

    #[test]
    fn step_advances_state() {
        let mut t = trainer(BatchMix::Always);
        let ds = dataset();
        let batch = ds.epoch_batches(0).next().unwrap();
        let outcome = t.step(&batch).unwrap();
        assert!(outcome.adversarial);
        assert!(!outcome.skipped);
        assert_eq!(t.state().step, 1);
        assert_eq!(t.phase(), TrainerPhase::Idle);
    }

    #[test]
    fn alternate_mix_alternates() {
        let mut t = trainer(BatchMix::Alternate);
        let ds = dataset();
        let batches: Vec<_> = ds.epoch_batches(0).collect();
        let first = t.step(&batches[0]).unwrap();
        let second = t.step(&batches[1]).unwrap();
        assert!(first.adversarial);
        assert!(!second.adversarial);
    }

    #[test]
    fn epoch_records_metrics_and_accuracies() {
        let mut t = trainer(BatchMix::Always);
        let ds = dataset();
        let mut recorder = VecRecorder::default();
        let report = t.run_epoch(&ds, &mut recorder).unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(recorder.rows.len(), 1);
        assert_eq!(t.state().epoch, 1);
    }

    #[test]
    fn nan_batch_is_skipped_without_step() {
        let mut t = trainer(BatchMix::Always);
        let inputs = ArrayD::from_shape_vec(vec![2, 2], vec![f32::NAN, 0.0, 1.0, 0.0]).unwrap();
        let batch = Batch::new(inputs, vec![0, 1]).unwrap();
        let outcome = t.step(&batch).unwrap();
        assert!(outcome.skipped);
        assert_eq!(t.state().step, 0);
    }

    #[test]
    fn checkpoint_round_trip_restores_trainer() {
        let mut t = trainer(BatchMix::Always);
        let ds = dataset();
        let mut recorder = VecRecorder::default();
        t.run_epoch(&ds, &mut recorder).unwrap();
        let snapshot = t.checkpoint_state();

        let mut fresh = trainer(BatchMix::Always);
        fresh.restore_state(&snapshot).unwrap();
        assert_eq!(fresh.state(), t.state());
        assert_eq!(
            fresh.model().parameters(),
            t.model().parameters()
        );
    }
}
