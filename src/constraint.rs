//! Perturbation constraint sets and projection.
//!
//! A [`ConstraintSpec`] encodes the perturbation budget for an attack: the
//! norm ball (L0, L2, or Linf with a radius) and the valid input value
//! range. [`ConstraintSpec::project`] maps an arbitrary perturbation batch
//! to the nearest feasible point, one example at a time along the batch
//! axis.
//!
//! Projection is exact and idempotent for Linf and L0. For L2 it is
//! approximate: the perturbation is rescaled onto the ball and the summed
//! result is then clipped into the value range, which can push the
//! perturbation slightly outside the ball again. This matches standard
//! practice; callers that need the exact L2-ball-intersect-box projection
//! must iterate externally.

use ndarray::{ArrayD, ArrayViewMutD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Norm under which the perturbation budget is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Count of nonzero coordinates; the radius is interpreted as the
    /// maximum number of perturbed coordinates per example.
    L0,
    /// Euclidean norm.
    L2,
    /// Maximum absolute coordinate.
    Linf,
}

/// Immutable perturbation budget: norm ball plus valid value range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    /// Norm the radius is measured in.
    pub norm: NormKind,
    /// Ball radius. Must be positive.
    pub radius: f32,
    /// Inclusive valid range `[lo, hi]` for input values. `lo < hi`.
    pub value_range: (f32, f32),
}

impl ConstraintSpec {
    /// Creates a validated constraint spec.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] if `radius <= 0` or `lo >= hi`.
    pub fn new(norm: NormKind, radius: f32, value_range: (f32, f32)) -> Result<Self> {
        let spec = Self {
            norm,
            radius,
            value_range,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that `radius > 0` and `lo < hi`.
    pub fn validate(&self) -> Result<()> {
        if !(self.radius > 0.0) {
            return Err(TrainError::Config(format!(
                "constraint radius must be positive, got {}",
                self.radius
            )));
        }
        let (lo, hi) = self.value_range;
        if !(lo < hi) {
            return Err(TrainError::Config(format!(
                "constraint value range must satisfy lo < hi, got [{lo}, {hi}]"
            )));
        }
        Ok(())
    }

    /// Projects a perturbation batch onto the feasible set.
    ///
    /// `perturbation` and `base` must have identical shapes with the batch
    /// along axis 0. Each example is projected independently: first onto
    /// the norm ball, then so that `base + perturbation` stays inside the
    /// value range.
    pub fn project(&self, perturbation: &ArrayD<f32>, base: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if perturbation.shape() != base.shape() {
            return Err(TrainError::ShapeMismatch {
                expected: base.shape().to_vec(),
                actual: perturbation.shape().to_vec(),
            });
        }
        let mut out = perturbation.clone();
        for (mut delta, input) in out
            .axis_iter_mut(Axis(0))
            .zip(base.axis_iter(Axis(0)))
        {
            match self.norm {
                NormKind::Linf => {
                    let r = self.radius;
                    delta.mapv_inplace(|v| v.clamp(-r, r));
                }
                NormKind::L2 => {
                    let norm = delta.iter().map(|v| v * v).sum::<f32>().sqrt();
                    if norm > self.radius && norm > 0.0 {
                        let scale = self.radius / norm;
                        delta.mapv_inplace(|v| v * scale);
                    }
                }
                NormKind::L0 => {
                    zero_all_but_k_largest(&mut delta, self.radius as usize);
                }
            }
            // Only adjust when the sum escapes the range, so in-range
            // perturbations pass through bit-exact.
            let (lo, hi) = self.value_range;
            for (d, &x) in delta.iter_mut().zip(input.iter()) {
                let sum = x + *d;
                if sum < lo {
                    *d = lo - x;
                } else if sum > hi {
                    *d = hi - x;
                }
            }
        }
        Ok(out)
    }

    /// Returns whether a single example's perturbation satisfies the norm
    /// ball within `tol` and keeps `base + perturbation` inside the value
    /// range.
    #[must_use]
    pub fn contains(&self, perturbation: &ArrayD<f32>, base: &ArrayD<f32>, tol: f32) -> bool {
        let in_ball = match self.norm {
            NormKind::Linf => perturbation.iter().all(|v| v.abs() <= self.radius + tol),
            NormKind::L2 => {
                perturbation.iter().map(|v| v * v).sum::<f32>().sqrt() <= self.radius + tol
            }
            NormKind::L0 => {
                perturbation.iter().filter(|v| v.abs() > tol).count() <= self.radius as usize
            }
        };
        let (lo, hi) = self.value_range;
        in_ball
            && perturbation
                .iter()
                .zip(base.iter())
                .all(|(d, x)| (x + d) >= lo - tol && (x + d) <= hi + tol)
    }
}

/// Zeroes every coordinate except the `k` of largest magnitude.
fn zero_all_but_k_largest(delta: &mut ArrayViewMutD<'_, f32>, k: usize) {
    let len = delta.len();
    if k >= len {
        return;
    }
    let mut magnitudes: Vec<(usize, f32)> = delta
        .iter()
        .enumerate()
        .map(|(i, v)| (i, v.abs()))
        .collect();
    magnitudes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let keep: std::collections::HashSet<usize> =
        magnitudes.iter().take(k).map(|(i, _)| *i).collect();
    for (i, v) in delta.iter_mut().enumerate() {
        if !keep.contains(&i) {
            *v = 0.0;
        }
    }
}
