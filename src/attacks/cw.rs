//! Optimization-based minimal-distortion attack.

use ndarray::{ArrayD, Axis};

use crate::data::Batch;
use crate::error::Result;
use crate::metrics::argmax_predictions;
use crate::Model;

use super::{
    attack_labels, objective_met, step_direction, AttackContext, AttackStrategy, InputGradScope,
    StrategyKind,
};

/// Searches for the smallest perturbation that flips the prediction.
///
/// The trade-off constant `c` between distortion and misclassification is
/// binary-searched per example (outer loop) while gradient descent
/// minimizes `||delta||^2 + c * loss_term` (inner loop), projecting into
/// the constraint set after every step. The search runs to its iteration
/// budget and returns the smallest successful perturbation found per
/// example, or the final attempt where none succeeded; callers decide
/// success by re-evaluating the model.
pub struct MinimalDistortion;

impl AttackStrategy for MinimalDistortion {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MinimalDistortion
    }

    fn generate(
        &self,
        model: &mut dyn Model,
        batch: &Batch,
        ctx: &mut AttackContext<'_>,
    ) -> Result<ArrayD<f32>> {
        let config = ctx.config;
        let n = batch.len();
        let labels = attack_labels(batch, config.targeted);
        // The surrogate minimizes ||delta||^2 - c*CE(true) untargeted, or
        // ||delta||^2 + c*CE(target) targeted.
        let loss_sign = -step_direction(config.targeted.is_some());

        let mut tradeoff = vec![config.initial_tradeoff; n];
        let mut lower = vec![0.0_f32; n];
        let mut upper = vec![f32::INFINITY; n];
        let mut best = ArrayD::<f32>::zeros(batch.inputs.raw_dim());
        let mut best_norm = vec![f32::INFINITY; n];
        let mut found = vec![false; n];
        let mut last = ArrayD::<f32>::zeros(batch.inputs.raw_dim());

        let scope = InputGradScope::enter(model);
        'search: for _ in 0..config.search_steps {
            let mut delta = if config.random_start {
                ctx.random_start(&batch.inputs)?
            } else {
                ArrayD::zeros(batch.inputs.raw_dim())
            };

            for _ in 0..config.iterations {
                if !ctx.consume() {
                    break 'search;
                }
                let adversarial = &batch.inputs + &delta;
                let gradient = scope.model().input_gradient(&adversarial, &labels)?;
                for (i, mut row) in delta.axis_iter_mut(Axis(0)).enumerate() {
                    let grad_row = gradient.index_axis(Axis(0), i);
                    let c = tradeoff[i];
                    row.zip_mut_with(&grad_row, |d, &g| {
                        *d -= config.step_size * (2.0 * *d + loss_sign * c * g);
                    });
                }
                delta = config.constraint.project(&delta, &batch.inputs)?;
            }

            let adversarial = &batch.inputs + &delta;
            let logits = scope.model().forward(&adversarial)?;
            let predictions = argmax_predictions(&logits);
            for i in 0..n {
                let row = delta.index_axis(Axis(0), i);
                if objective_met(predictions[i], batch.labels[i], config.targeted) {
                    let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if norm < best_norm[i] {
                        best_norm[i] = norm;
                        best.index_axis_mut(Axis(0), i).assign(&row);
                    }
                    found[i] = true;
                    // success: shrink c to look for a smaller distortion
                    upper[i] = tradeoff[i];
                    tradeoff[i] = 0.5 * (lower[i] + upper[i]);
                } else {
                    // failure: weight misclassification more heavily
                    lower[i] = tradeoff[i];
                    tradeoff[i] = if upper[i].is_finite() {
                        0.5 * (lower[i] + upper[i])
                    } else {
                        tradeoff[i] * 10.0
                    };
                }
            }
            last = delta;
        }
        drop(scope);

        for i in 0..n {
            if found[i] {
                last.index_axis_mut(Axis(0), i)
                    .assign(&best.index_axis(Axis(0), i));
            }
        }
        Ok(last)
    }
}
