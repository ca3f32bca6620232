//! Attack strategies and dispatch.
//!
//! Every strategy implements [`AttackStrategy`]: given a model, a batch,
//! and an [`AttackContext`] (configuration, budget, seeded randomness),
//! produce a perturbation batch that respects the constraint set. The
//! engine resolves a [`StrategyKind`] from the configured strategy id
//! once at construction and holds a single boxed strategy, with no runtime
//! type inspection.
//!
//! Strategies never mutate model parameters: gradients flow through
//! `&dyn Model` receivers, and input-gradient tracking is flipped only
//! inside an [`InputGradScope`], which restores the prior tracking state
//! on every exit path, including early returns and panics.

mod cw;
mod fgsm;
mod pgd;

pub use cw::MinimalDistortion;
pub use fgsm::SingleStepSign;
pub use pgd::ProjectedGradient;

use std::time::Instant;

use ndarray::ArrayD;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::AttackConfig;
use crate::data::Batch;
use crate::error::{Result, TrainError};
use crate::Model;

/// The registered attack strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// One signed-gradient step ("fgsm").
    SingleStep,
    /// Iterative projected gradient ("pgd").
    Iterative,
    /// Optimization-based minimal-distortion search ("cw").
    MinimalDistortion,
}

impl StrategyKind {
    /// Resolves a strategy id to its kind.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::UnknownStrategy`] for unregistered ids.
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "fgsm" => Ok(StrategyKind::SingleStep),
            "pgd" => Ok(StrategyKind::Iterative),
            "cw" => Ok(StrategyKind::MinimalDistortion),
            other => Err(TrainError::UnknownStrategy(other.to_string())),
        }
    }

    /// Instantiates the strategy for this kind.
    #[must_use]
    pub fn build(self) -> Box<dyn AttackStrategy> {
        match self {
            StrategyKind::SingleStep => Box::new(SingleStepSign),
            StrategyKind::Iterative => Box::new(ProjectedGradient),
            StrategyKind::MinimalDistortion => Box::new(MinimalDistortion),
        }
    }

    /// Checks strategy-specific configuration combinations.
    pub fn validate_config(self, config: &AttackConfig) -> Result<()> {
        config.validate()?;
        match self {
            StrategyKind::SingleStep => Ok(()),
            StrategyKind::Iterative => {
                if config.iterations == 0 {
                    return Err(TrainError::Config(
                        "iterative strategy requires iterations >= 1".to_string(),
                    ));
                }
                Ok(())
            }
            StrategyKind::MinimalDistortion => {
                if config.iterations == 0 || config.search_steps == 0 {
                    return Err(TrainError::Config(
                        "minimal-distortion strategy requires iterations >= 1 and search_steps >= 1"
                            .to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Total gradient-iteration budget implied by the configuration.
    #[must_use]
    pub fn total_iteration_budget(self, config: &AttackConfig) -> usize {
        match self {
            StrategyKind::SingleStep => 1,
            StrategyKind::Iterative => config.effective_iteration_cap(),
            StrategyKind::MinimalDistortion => {
                let per_search = config.effective_iteration_cap();
                per_search.saturating_mul(config.search_steps)
            }
        }
    }
}

/// Per-invocation context handed to a strategy: configuration, iteration
/// and wall-clock budget, and the seeded random stream for this batch.
pub struct AttackContext<'a> {
    /// The attack configuration.
    pub config: &'a AttackConfig,
    /// Seeded randomness for this batch only.
    pub rng: &'a mut ChaCha8Rng,
    budget: usize,
    used: usize,
    deadline: Option<Instant>,
}

impl<'a> AttackContext<'a> {
    /// Creates a context with the given gradient-iteration budget and
    /// optional wall-clock deadline.
    #[must_use]
    pub fn new(
        config: &'a AttackConfig,
        rng: &'a mut ChaCha8Rng,
        budget: usize,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            config,
            rng,
            budget,
            used: 0,
            deadline,
        }
    }

    /// Consumes one gradient iteration from the budget. Returns `false`
    /// once the iteration budget or deadline is exhausted.
    pub fn consume(&mut self) -> bool {
        if self.used >= self.budget {
            return false;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        self.used += 1;
        true
    }

    /// Gradient iterations consumed so far.
    #[must_use]
    pub fn iterations_used(&self) -> usize {
        self.used
    }

    /// Samples a fresh random perturbation inside the ball, already
    /// projected against `base`.
    pub fn random_start(&mut self, base: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let r = self.config.constraint.radius;
        let raw = ArrayD::from_shape_fn(base.raw_dim(), |_| self.rng.gen_range(-r..=r));
        self.config.constraint.project(&raw, base)
    }
}

/// Common contract for perturbation algorithms.
pub trait AttackStrategy: Send + Sync {
    /// The kind this strategy implements.
    fn kind(&self) -> StrategyKind;

    /// Generates a perturbation batch for `batch` against `model`.
    ///
    /// The returned tensor has the batch's input shape and satisfies the
    /// context's constraint set. Model parameters are never written.
    fn generate(
        &self,
        model: &mut dyn Model,
        batch: &Batch,
        ctx: &mut AttackContext<'_>,
    ) -> Result<ArrayD<f32>>;
}

/// Scoped enable/restore of input-gradient tracking.
///
/// Construction flips tracking on and remembers the prior state; `Drop`
/// restores it, so the toggle cannot leak past the attack even on error
/// paths.
pub struct InputGradScope<'m> {
    model: &'m mut dyn Model,
    previous: bool,
}

impl<'m> InputGradScope<'m> {
    /// Enables input-gradient tracking on `model`.
    pub fn enter(model: &'m mut dyn Model) -> Self {
        let previous = model.set_input_tracking(true);
        Self { model, previous }
    }

    /// Read access to the model while the scope is held.
    #[must_use]
    pub fn model(&self) -> &dyn Model {
        &*self.model
    }
}

impl Drop for InputGradScope<'_> {
    fn drop(&mut self) {
        self.model.set_input_tracking(self.previous);
    }
}

/// Three-valued sign: `sign(0) = 0`, and NaN maps to `0` rather than
/// poisoning the perturbation.
#[must_use]
pub(crate) fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Labels the gradient is taken against: the target label everywhere when
/// targeted, the true labels otherwise.
pub(crate) fn attack_labels(batch: &Batch, targeted: Option<usize>) -> Vec<usize> {
    match targeted {
        Some(target) => vec![target; batch.len()],
        None => batch.labels.clone(),
    }
}

/// Ascent for untargeted attacks, descent toward the target otherwise.
pub(crate) fn step_direction(targeted: bool) -> f32 {
    if targeted {
        -1.0
    } else {
        1.0
    }
}

/// Whether one example already satisfies the attack objective.
pub(crate) fn objective_met(prediction: usize, true_label: usize, targeted: Option<usize>) -> bool {
    match targeted {
        Some(target) => prediction == target,
        None => prediction != true_label,
    }
}
