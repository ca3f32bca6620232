//! # adversarial-trainer-rs
//!
//! Adversarial example generation, adversarial training, and distributed
//! robustness evaluation for image-classification models.
//!
//! ## Overview
//!
//! The crate is built around three cooperating pieces:
//!
//! 1. **Attack engine**: pluggable perturbation strategies (single-step
//!    sign, iterative projected gradient, minimal-distortion search) run
//!    under a [`ConstraintSpec`](constraint::ConstraintSpec) budget with
//!    random-start, early-stop, and runaway-cap policy applied uniformly.
//! 2. **Adversarial trainer**: a training loop that interleaves clean and
//!    adversarial batches, combines their cross-entropy losses, skips
//!    NaN batches, and evaluates robust accuracy at epoch boundaries.
//! 3. **Distributed coordinator**: a leader/follower round protocol that
//!    broadcasts a parameter snapshot and seed, collects shard-weighted
//!    gradients under a quorum-or-timeout rule, and survives worker
//!    departures mid-round.
//!
//! Models, optimizers, and datasets stay outside the core behind the
//! [`Model`], [`Optimizer`], and [`data::DataSource`] contracts, so any
//! framework that can produce logits and input gradients plugs in.
//!
//! ## Quick start
//!
//! ```no_run
//! use adversarial_trainer_rs::prelude::*;
//!
//! let constraint = ConstraintSpec::new(NormKind::Linf, 0.03, (0.0, 1.0))?;
//! let config = TrainerConfig::builder()
//!     .attack(AttackConfig::pgd(constraint, 0.007, 10))
//!     .mix(BatchMix::Always)
//!     .build();
//!
//! // let mut trainer = AdversarialTrainer::new(model, optimizer, config)?;
//! // for _ in 0..10 {
//! //     let report = trainer.run_epoch(&dataset, &mut recorder)?;
//! //     println!("robust accuracy: {:.3}", report.robust_accuracy);
//! // }
//! # Ok::<(), adversarial_trainer_rs::TrainError>(())
//! ```
//!
//! ## Modules
//!
//! - [`constraint`] - norm-ball budgets and projection
//! - [`attacks`] - perturbation strategies and dispatch
//! - [`engine`] - attack policy wrapper and per-batch outcomes
//! - [`trainer`] - the adversarial training loop
//! - [`coordinator`] - distributed rounds, heartbeats, and aggregation
//! - [`config`] - serde/TOML configuration with fail-fast validation
//! - [`checkpoint`] - versioned train-state snapshots
//! - [`metrics`] - robustness accounting and the evaluation contract
//! - [`models`] - reference linear classifier and SGD for validation

#![warn(missing_docs)]
#![deny(unsafe_code)]
// Precision-loss casts are routine in ML numerical code.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod attacks;
pub mod checkpoint;
pub mod config;
pub mod constraint;
pub mod coordinator;
pub mod data;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod stability;
pub mod trainer;

use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};

pub use config::{AttackConfig, BatchMix, CoordinatorConfig, TrainerConfig};
pub use constraint::{ConstraintSpec, NormKind};
pub use error::{Result, TrainError};

/// Contract for the external model collaborator.
///
/// The core never owns a model; it holds one per step and requires only a
/// differentiable forward pass plus parameter access. Attack strategies
/// call [`Model::input_gradient`] with parameters held read-only
/// (`&self`), so no strategy can step the optimizer or write weights.
///
/// Input-gradient tracking is toggled through
/// [`Model::set_input_tracking`]; frameworks with a tape or graph should
/// map this onto their tracking switch for non-parameter tensors so that
/// parameter gradients are unaffected. Attack code only flips it through
/// the scoped guard in [`attacks::InputGradScope`], which restores the
/// previous state on every exit path.
pub trait Model: Send {
    /// Forward pass: `(batch, ...)` inputs to `(batch, classes)` logits.
    fn forward(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>>;

    /// Snapshot of the parameter tensors, in a stable order.
    fn parameters(&self) -> Vec<ArrayD<f32>>;

    /// Overwrites the parameters from a snapshot in the same order.
    fn set_parameters(&mut self, params: &[ArrayD<f32>]) -> Result<()>;

    /// Gradient of the summed cross-entropy loss with respect to the
    /// inputs, per example. Parameters are read-only here.
    fn input_gradient(&self, inputs: &ArrayD<f32>, labels: &[usize]) -> Result<ArrayD<f32>>;

    /// Mean cross-entropy loss and its gradient with respect to each
    /// parameter tensor, in [`Model::parameters`] order.
    fn loss_and_gradients(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
    ) -> Result<(f32, Vec<ArrayD<f32>>)>;

    /// Enables or disables gradient tracking on input tensors, returning
    /// the previous state.
    fn set_input_tracking(&mut self, enabled: bool) -> bool;

    /// Current input-tracking state.
    fn input_tracking(&self) -> bool;
}

/// Contract for the optimizer collaborator.
///
/// Optimizers update a parameter snapshot in place from same-shaped
/// gradients; the trainer writes the snapshot back through
/// [`Model::set_parameters`]. Internal state (momentum buffers, step
/// counts) must round-trip through [`OptimizerState`] for checkpointing.
pub trait Optimizer: Send {
    /// Applies one update step to `params` using `grads`.
    fn step(&mut self, params: &mut [ArrayD<f32>], grads: &[ArrayD<f32>]) -> Result<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f32;

    /// Sets the learning rate (for schedules).
    fn set_learning_rate(&mut self, lr: f32);

    /// Serializable snapshot of the optimizer's internal state.
    fn state(&self) -> OptimizerState;

    /// Restores internal state from a snapshot.
    fn restore(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Serializable optimizer internals: update count plus any per-parameter
/// buffers (momentum, variance estimates) in parameter order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Number of update steps applied.
    pub step_count: u64,
    /// Per-parameter state buffers, shaped like the parameters.
    pub buffers: Vec<ArrayD<f32>>,
}

/// Prelude for convenient imports.
///
/// ```
/// use adversarial_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{AttackConfig, BatchMix, CoordinatorConfig, TrainerConfig};
    pub use crate::constraint::{ConstraintSpec, NormKind};
    pub use crate::data::{Batch, DataSource, InMemoryDataset};
    pub use crate::engine::{AttackEngine, AttackOutcome};
    pub use crate::error::{Result, TrainError};
    pub use crate::metrics::EvalRecorder;
    pub use crate::trainer::{AdversarialTrainer, TrainState};
    pub use crate::{Model, Optimizer, OptimizerState};
}
