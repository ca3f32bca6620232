//! Attack engine: policy wrapper around one strategy.
//!
//! The engine owns the strategy selected at construction and applies the
//! policy the strategies themselves don't carry: fresh random-start seeds
//! per batch (never reused, so correlated failures across batches can't
//! hide a weak attack), a hard iteration/wall-clock cap layered over the
//! strategy's own loop, and per-example containment of numerical
//! failures: a NaN gradient zeroes that example's perturbation and flags
//! it instead of aborting the batch.

use std::time::{Duration, Instant};

use ndarray::{ArrayD, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::attacks::{AttackContext, AttackStrategy, StrategyKind};
use crate::config::AttackConfig;
use crate::data::Batch;
use crate::error::Result;
use crate::metrics::argmax_predictions;
use crate::Model;

/// Result of perturbing one batch.
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    /// `inputs + perturbation`, ready for the loss pass.
    pub adversarial: ArrayD<f32>,
    /// The perturbation itself, projected into the constraint set.
    pub perturbation: ArrayD<f32>,
    /// Model predictions on the adversarial inputs.
    pub predictions: Vec<usize>,
    /// Per example: did the perturbed prediction differ from the clean
    /// prediction (or hit the target when targeted)?
    pub success: Vec<bool>,
    /// Per example: was the perturbation reset to zero after a numerical
    /// failure?
    pub degenerate: Vec<bool>,
    /// Fraction of successful examples.
    pub success_rate: f32,
    /// Gradient iterations the strategy consumed.
    pub iterations_used: usize,
    /// Wall-clock time spent in the strategy.
    pub elapsed: Duration,
}

/// Configured attack engine holding a single strategy instance.
pub struct AttackEngine {
    config: AttackConfig,
    kind: StrategyKind,
    strategy: Box<dyn AttackStrategy>,
    seed_stream: ChaCha8Rng,
}

impl AttackEngine {
    /// Resolves and validates the configured strategy.
    ///
    /// # Errors
    ///
    /// [`TrainError::UnknownStrategy`](crate::TrainError::UnknownStrategy)
    /// for an unregistered id; [`TrainError::Config`](crate::TrainError::Config)
    /// for invalid parameter combinations. Both fire here, never mid-batch.
    pub fn new(config: AttackConfig, seed: u64) -> Result<Self> {
        let kind = StrategyKind::from_id(&config.strategy)?;
        kind.validate_config(&config)?;
        Ok(Self {
            kind,
            strategy: kind.build(),
            config,
            seed_stream: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// The engine's attack configuration.
    #[must_use]
    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// The resolved strategy kind.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Re-seeds the per-batch seed stream. The coordinator calls this
    /// with each round's broadcast seed so all workers draw compatible
    /// randomness.
    pub fn reseed(&mut self, seed: u64) {
        self.seed_stream = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Perturbs one batch and reports the outcome.
    ///
    /// Model parameters are read-only throughout; only input gradients
    /// are taken, inside the strategy's tracking scope.
    pub fn perturb(&mut self, model: &mut dyn Model, batch: &Batch) -> Result<AttackOutcome> {
        let clean_logits = model.forward(&batch.inputs)?;
        let clean_predictions = argmax_predictions(&clean_logits);

        // Fresh child seed per batch; the stream position advances so no
        // two batches share a random start.
        let batch_seed: u64 = self.seed_stream.gen();
        let mut rng = ChaCha8Rng::seed_from_u64(batch_seed);

        let budget = self.kind.total_iteration_budget(&self.config);
        let deadline = self
            .config
            .time_cap_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut ctx = AttackContext::new(&self.config, &mut rng, budget, deadline);

        let started = Instant::now();
        let mut perturbation = self.strategy.generate(model, batch, &mut ctx)?;
        let elapsed = started.elapsed();
        let iterations_used = ctx.iterations_used();

        // Contain numerical failures per example.
        let mut degenerate = vec![false; batch.len()];
        for (i, mut row) in perturbation.axis_iter_mut(Axis(0)).enumerate() {
            if row.iter().any(|v| !v.is_finite()) {
                row.fill(0.0);
                degenerate[i] = true;
            }
        }
        if degenerate.iter().any(|&d| d) {
            warn!(
                strategy = %self.config.strategy,
                flagged = degenerate.iter().filter(|&&d| d).count(),
                "non-finite perturbations zeroed"
            );
        }

        let adversarial = &batch.inputs + &perturbation;
        let adv_logits = model.forward(&adversarial)?;
        let adv_predictions = argmax_predictions(&adv_logits);

        let success: Vec<bool> = adv_predictions
            .iter()
            .zip(clean_predictions.iter())
            .map(|(&adv, &clean)| match self.config.targeted {
                Some(target) => adv == target,
                None => adv != clean,
            })
            .collect();
        let success_rate = if success.is_empty() {
            0.0
        } else {
            success.iter().filter(|&&s| s).count() as f32 / success.len() as f32
        };

        debug!(
            strategy = %self.config.strategy,
            batch = batch.len(),
            success_rate,
            iterations_used,
            "batch perturbed"
        );

        Ok(AttackOutcome {
            adversarial,
            perturbation,
            predictions: adv_predictions,
            success,
            degenerate,
            success_rate,
            iterations_used,
            elapsed,
        })
    }
}
