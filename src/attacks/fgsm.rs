//! Single-step signed-gradient attack.

use ndarray::ArrayD;

use crate::data::Batch;
use crate::error::Result;
use crate::Model;

use super::{
    attack_labels, sign, step_direction, AttackContext, AttackStrategy, InputGradScope,
    StrategyKind,
};

/// One step of `step_size * sign(gradient)`, projected once.
///
/// Deterministic for a fixed model and input unless `random_start` is
/// set, in which case the perturbation begins at a random point inside
/// the ball before the step. A zero step size yields the zero
/// perturbation.
pub struct SingleStepSign;

impl AttackStrategy for SingleStepSign {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SingleStep
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
        let scope = InputGradScope::enter(model);
        let adversarial = &batch.inputs + &delta;
        let gradient = scope.model().input_gradient(&adversarial, &labels)?;
        drop(scope);

        let step = direction * config.step_size;
        delta.zip_mut_with(&gradient, |d, &g| *d += step * sign(g));
        config.constraint.project(&delta, &batch.inputs)
    }
}
