//! Reference model and optimizer implementations for validation.
//!
//! Real deployments bring their own framework behind the [`Model`] and
//! [`Optimizer`] traits. The linear softmax classifier here has
//! closed-form input and parameter gradients, which makes attack and
//! trainer behavior checkable to machine precision in tests. A fixed
//! linear model has a known gradient sign pattern, so expected
//! perturbations can be written down exactly.

use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2};

use crate::error::{Result, TrainError};
use crate::{Model, Optimizer, OptimizerState};

/// Multinomial logistic regression over flattened inputs.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    weight: Array2<f32>,
    bias: Array1<f32>,
    input_tracking: bool,
}

impl LinearClassifier {
    /// Zero-initialized classifier with `classes x features` weights.
    #[must_use]
    pub fn new(classes: usize, features: usize) -> Self {
        Self {
            weight: Array2::zeros((classes, features)),
            bias: Array1::zeros(classes),
            input_tracking: false,
        }
    }

    /// Classifier with explicit weights and biases.
    pub fn with_weights(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![weight.nrows()],
                actual: vec![bias.len()],
            });
        }
        Ok(Self {
            weight,
            bias,
            input_tracking: false,
        })
    }

    /// Number of classes.
    #[must_use]
    pub fn classes(&self) -> usize {
        self.weight.nrows()
    }

    fn features(&self) -> usize {
        self.weight.ncols()
    }

    /// Flattens `(batch, ...)` inputs to `(batch, features)`.
    fn flatten(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        let batch = inputs.len_of(Axis(0));
        let per_example: usize = inputs.len() / batch.max(1);
        if per_example != self.features() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![batch, self.features()],
                actual: inputs.shape().to_vec(),
            });
        }
        inputs
            .to_owned()
            .into_shape((batch, per_example))
            .map_err(|e| TrainError::Model(format!("input reshape failed: {e}")))
    }

    /// Row-stable softmax.
    fn softmax(logits: &Array2<f32>) -> Array2<f32> {
        let mut out = logits.clone();
        for mut row in out.rows_mut() {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            row.mapv_inplace(|v| (v - max).exp());
            let sum: f32 = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
        out
    }

    /// `softmax - onehot`, the cross-entropy gradient in logit space.
    fn logit_gradient(probs: &Array2<f32>, labels: &[usize]) -> Array2<f32> {
        let mut grad = probs.clone();
        for (i, &label) in labels.iter().enumerate() {
            grad[[i, label]] -= 1.0;
        }
        grad
    }
}

impl Model for LinearClassifier {
    fn forward(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        let flat = self.flatten(inputs)?;
        Ok(flat.dot(&self.weight.t()) + &self.bias)
    }

    fn parameters(&self) -> Vec<ArrayD<f32>> {
        vec![
            self.weight.clone().into_dyn(),
            self.bias.clone().into_dyn(),
        ]
    }

    fn set_parameters(&mut self, params: &[ArrayD<f32>]) -> Result<()> {
        if params.len() != 2 {
            return Err(TrainError::Model(format!(
                "expected 2 parameter tensors, got {}",
                params.len()
            )));
        }
        self.weight = params[0]
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|e| TrainError::Model(format!("weight shape: {e}")))?;
        self.bias = params[1]
            .clone()
            .into_dimensionality::<Ix1>()
            .map_err(|e| TrainError::Model(format!("bias shape: {e}")))?;
        Ok(())
    }

    fn input_gradient(&self, inputs: &ArrayD<f32>, labels: &[usize]) -> Result<ArrayD<f32>> {
        let flat = self.flatten(inputs)?;
        let probs = Self::softmax(&(flat.dot(&self.weight.t()) + &self.bias));
        let logit_grad = Self::logit_gradient(&probs, labels);
        // Gradient of the summed loss decomposes per example.
        let grad_flat = logit_grad.dot(&self.weight);
        grad_flat
            .into_shape(inputs.raw_dim())
            .map_err(|e| TrainError::Model(format!("gradient reshape failed: {e}")))
    }

    fn loss_and_gradients(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
    ) -> Result<(f32, Vec<ArrayD<f32>>)> {
        let flat = self.flatten(inputs)?;
        let n = labels.len().max(1) as f32;
        let probs = Self::softmax(&(flat.dot(&self.weight.t()) + &self.bias));
        let loss = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| -(probs[[i, label]].max(1e-12).ln()))
            .sum::<f32>()
            / n;
        let logit_grad = Self::logit_gradient(&probs, labels) / n;
        let weight_grad = logit_grad.t().dot(&flat);
        let bias_grad = logit_grad.sum_axis(Axis(0));
        Ok((loss, vec![weight_grad.into_dyn(), bias_grad.into_dyn()]))
    }

    fn set_input_tracking(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.input_tracking, enabled)
    }

    fn input_tracking(&self) -> bool {
        self.input_tracking
    }
}

/// Plain SGD with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    state: OptimizerState,
}

impl Sgd {
    /// SGD without momentum.
    #[must_use]
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            state: OptimizerState::default(),
        }
    }

    /// SGD with momentum.
    #[must_use]
    pub fn with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            state: OptimizerState::default(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [ArrayD<f32>], grads: &[ArrayD<f32>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![params.len()],
                actual: vec![grads.len()],
            });
        }
        if self.momentum > 0.0 && self.state.buffers.len() != params.len() {
            self.state.buffers = params.iter().map(|p| ArrayD::zeros(p.raw_dim())).collect();
        }
        let (lr, momentum) = (self.learning_rate, self.momentum);
        for (i, (param, grad)) in params.iter_mut().zip(grads.iter()).enumerate() {
            if param.shape() != grad.shape() {
                return Err(TrainError::ShapeMismatch {
                    expected: param.shape().to_vec(),
                    actual: grad.shape().to_vec(),
                });
            }
            if momentum > 0.0 {
                let velocity = &mut self.state.buffers[i];
                velocity.zip_mut_with(grad, |v, &g| *v = momentum * *v + g);
                param.zip_mut_with(velocity, |p, &v| *p -= lr * v);
            } else {
                param.zip_mut_with(grad, |p, &g| *p -= lr * g);
            }
        }
        self.state.step_count += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn state(&self) -> OptimizerState {
        self.state.clone()
    }

    fn restore(&mut self, state: &OptimizerState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }
}
