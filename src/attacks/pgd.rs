//! Iterative projected-gradient attack.

use ndarray::{ArrayD, Axis};

use crate::data::Batch;
use crate::error::Result;
use crate::metrics::argmax_predictions;
use crate::Model;

use super::{
    attack_labels, objective_met, sign, step_direction, AttackContext, AttackStrategy,
    InputGradScope, StrategyKind,
};

/// Projected gradient descent in the ascent direction (descent toward the
/// target when targeted), projecting after every step.
///
/// With early stopping enabled, an example whose perturbed prediction
/// already satisfies the objective is frozen: its perturbation is not
/// touched by later iterations. The batch is never shortened; a
/// per-example mask gates the updates, and gradients are still computed
/// for the full batch.
pub struct ProjectedGradient;

impl AttackStrategy for ProjectedGradient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Iterative
    }

    fn generate(
        &self,
        model: &mut dyn Model,
        batch: &Batch,
        ctx: &mut AttackContext<'_>,
    ) -> Result<ArrayD<f32>> {
        let config = ctx.config;
        let mut delta = if config.random_start {
            ctx.random_start(&batch.inputs)?
        } else {
            ArrayD::zeros(batch.inputs.raw_dim())
        };

        let labels = attack_labels(batch, config.targeted);
        let direction = step_direction(config.targeted.is_some());
        let step = direction * config.step_size;
        let mut active = vec![true; batch.len()];

        let scope = InputGradScope::enter(model);
        for _ in 0..config.iterations {
            if !ctx.consume() {
                break;
            }
            let adversarial = &batch.inputs + &delta;

            if config.early_stop {
                let logits = scope.model().forward(&adversarial)?;
                let predictions = argmax_predictions(&logits);
                for (i, &prediction) in predictions.iter().enumerate() {
                    if objective_met(prediction, batch.labels[i], config.targeted) {
                        active[i] = false;
                    }
                }
                if active.iter().all(|a| !a) {
                    break;
                }
            }

            let gradient = scope.model().input_gradient(&adversarial, &labels)?;
            let frozen = delta.clone();
            for (i, mut row) in delta.axis_iter_mut(Axis(0)).enumerate() {
                if !active[i] {
                    continue;
                }
                let grad_row = gradient.index_axis(Axis(0), i);
                row.zip_mut_with(&grad_row, |d, &g| *d += step * sign(g));
            }
            delta = config.constraint.project(&delta, &batch.inputs)?;
            // Projection must not disturb frozen rows either (the L2 box
            // clip is only near-idempotent), so restore them verbatim.
            for (i, mut row) in delta.axis_iter_mut(Axis(0)).enumerate() {
                if !active[i] {
                    row.assign(&frozen.index_axis(Axis(0), i));
                }
            }
        }
        drop(scope);

        Ok(delta)
    }
}
