//! Configuration types for attacks, training, and coordination.
//!
//! All configs are serde-serializable, loadable from TOML, and validated
//! before anything runs: numeric ranges here, strategy-specific
//! combinations at [`AttackEngine`](crate::engine::AttackEngine)
//! construction. An invalid configuration never survives past
//! construction into a training loop.
//!
//! # Example
//!
//! ```rust
//! use adversarial_trainer_rs::config::{AttackConfig, TrainerConfig};
//! use adversarial_trainer_rs::constraint::{ConstraintSpec, NormKind};
//!
//! let constraint = ConstraintSpec::new(NormKind::Linf, 0.03, (0.0, 1.0)).unwrap();
//! let config = TrainerConfig::builder()
//!     .attack(AttackConfig::pgd(constraint, 0.01, 10))
//!     .robust_weight(1.0)
//!     .clean_weight(0.5)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constraint::ConstraintSpec;
use crate::error::{Result, TrainError};

/// How adversarial batches are mixed into the training stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMix {
    /// Every batch is perturbed before the loss is computed.
    Always,
    /// Clean and adversarial batches alternate, starting adversarial.
    Alternate,
    /// Each batch is perturbed independently with this probability.
    Probability(f32),
}

impl BatchMix {
    fn validate(&self) -> Result<()> {
        if let BatchMix::Probability(p) = self {
            if !(0.0..=1.0).contains(p) {
                return Err(TrainError::Config(format!(
                    "batch mix probability must be in [0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for one attack invocation policy.
///
/// Validated once at [`AttackEngine`](crate::engine::AttackEngine)
/// construction; invalid strategy/parameter combinations (for example
/// `iterations = 0` for an iterative strategy) fail there, before any
/// batch is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Registered strategy id: `"fgsm"`, `"pgd"`, or `"cw"`.
    pub strategy: String,

    /// Per-iteration step size in input space. Non-negative.
    #[serde(default = "default_step_size")]
    pub step_size: f32,

    /// Number of attack iterations. Ignored by single-step strategies.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Start from a random point inside the ball instead of zero.
    #[serde(default)]
    pub random_start: bool,

    /// Freeze an example's perturbation once the attack objective is met.
    #[serde(default)]
    pub early_stop: bool,

    /// Attack toward this label instead of away from the true label.
    #[serde(default)]
    pub targeted: Option<usize>,

    /// Perturbation budget the strategy must respect.
    pub constraint: ConstraintSpec,

    /// Engine-level hard cap on iterations, independent of the strategy's
    /// own loop. `0` means "use `iterations`".
    #[serde(default)]
    pub iteration_cap: usize,

    /// Engine-level wall-clock cap per batch, in milliseconds.
    #[serde(default)]
    pub time_cap_ms: Option<u64>,

    /// Outer binary-search steps over the trade-off constant
    /// (minimal-distortion strategy only).
    #[serde(default = "default_search_steps")]
    pub search_steps: usize,

    /// Initial trade-off constant between distortion and misclassification
    /// (minimal-distortion strategy only).
    #[serde(default = "default_tradeoff")]
    pub initial_tradeoff: f32,
}

fn default_step_size() -> f32 {
    0.01
}
fn default_iterations() -> usize {
    10
}
fn default_search_steps() -> usize {
    5
}
fn default_tradeoff() -> f32 {
    1.0
}

impl AttackConfig {
    /// Single-step sign attack with the given constraint and step size.
    #[must_use]
    pub fn fgsm(constraint: ConstraintSpec, step_size: f32) -> Self {
        Self {
            strategy: "fgsm".to_string(),
            step_size,
            iterations: 1,
            random_start: false,
            early_stop: false,
            targeted: None,
            constraint,
            iteration_cap: 0,
            time_cap_ms: None,
            search_steps: default_search_steps(),
            initial_tradeoff: default_tradeoff(),
        }
    }

    /// Iterative projected-gradient attack.
    #[must_use]
    pub fn pgd(constraint: ConstraintSpec, step_size: f32, iterations: usize) -> Self {
        Self {
            strategy: "pgd".to_string(),
            step_size,
            iterations,
            ..Self::fgsm(constraint, step_size)
        }
    }

    /// Minimal-distortion search attack.
    #[must_use]
    pub fn cw(constraint: ConstraintSpec, step_size: f32, iterations: usize) -> Self {
        Self {
            strategy: "cw".to_string(),
            step_size,
            iterations,
            ..Self::fgsm(constraint, step_size)
        }
    }

    /// Checks numeric ranges. Strategy-specific combinations are checked
    /// at engine construction where the strategy id is resolved.
    pub fn validate(&self) -> Result<()> {
        self.constraint.validate()?;
        if self.step_size < 0.0 || !self.step_size.is_finite() {
            return Err(TrainError::Config(format!(
                "attack step size must be finite and non-negative, got {}",
                self.step_size
            )));
        }
        if self.initial_tradeoff <= 0.0 {
            return Err(TrainError::Config(format!(
                "initial trade-off constant must be positive, got {}",
                self.initial_tradeoff
            )));
        }
        Ok(())
    }

    /// Effective iteration bound: the engine cap when set, otherwise the
    /// configured iteration count.
    #[must_use]
    pub fn effective_iteration_cap(&self) -> usize {
        if self.iteration_cap == 0 {
            self.iterations
        } else {
            self.iteration_cap.min(self.iterations)
        }
    }
}

/// Checkpoint cadence and naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Save a checkpoint every this many epochs. `0` disables saving.
    #[serde(default = "default_checkpoint_interval")]
    pub interval_epochs: u64,

    /// Keep only the most recent N checkpoint files. `0` keeps all.
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,

    /// Filename prefix; files are named `<prefix>_epoch_<n>.json`.
    #[serde(default = "default_checkpoint_prefix")]
    pub prefix: String,
}

fn default_checkpoint_interval() -> u64 {
    0
}
fn default_keep_last_n() -> usize {
    3
}
fn default_checkpoint_prefix() -> String {
    "adv_train".to_string()
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            interval_epochs: default_checkpoint_interval(),
            keep_last_n: default_keep_last_n(),
            prefix: default_checkpoint_prefix(),
        }
    }
}

/// Main configuration for the adversarial trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Clean/adversarial batch mixing policy.
    #[serde(default = "default_mix")]
    pub mix: BatchMix,

    /// Weight of the clean cross-entropy term in the combined loss.
    #[serde(default = "default_clean_weight")]
    pub clean_weight: f32,

    /// Weight of the robust (adversarial) cross-entropy term.
    #[serde(default = "default_robust_weight")]
    pub robust_weight: f32,

    /// Attack used while training.
    pub attack: AttackConfig,

    /// Attack used during evaluation. Commonly stronger than the training
    /// attack; falls back to `attack` when absent.
    #[serde(default)]
    pub eval_attack: Option<AttackConfig>,

    /// Consecutive NaN-loss batches tolerated before aborting the run.
    #[serde(default = "default_nan_escalation")]
    pub nan_escalation: usize,

    /// Root seed for mixing draws and attack random starts.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
}

fn default_mix() -> BatchMix {
    BatchMix::Always
}
fn default_clean_weight() -> f32 {
    0.0
}
fn default_robust_weight() -> f32 {
    1.0
}
fn default_nan_escalation() -> usize {
    3
}
fn default_seed() -> u64 {
    0
}

impl TrainerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TrainerConfigBuilder {
        TrainerConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TrainError::Config(format!("failed to read config file: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TrainError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TrainError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| TrainError::Config(format!("failed to write config file: {e}")))
    }

    /// Validates numeric ranges and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        self.mix.validate()?;
        self.attack.validate()?;
        if let Some(eval) = &self.eval_attack {
            eval.validate()?;
        }
        if self.clean_weight < 0.0 || self.robust_weight < 0.0 {
            return Err(TrainError::Config(format!(
                "loss weights must be non-negative, got clean={} robust={}",
                self.clean_weight, self.robust_weight
            )));
        }
        if self.clean_weight == 0.0 && self.robust_weight == 0.0 {
            return Err(TrainError::Config(
                "at least one of clean_weight, robust_weight must be positive".to_string(),
            ));
        }
        if self.nan_escalation == 0 {
            return Err(TrainError::Config(
                "nan_escalation must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The attack configuration used at evaluation time.
    #[must_use]
    pub fn eval_attack(&self) -> &AttackConfig {
        self.eval_attack.as_ref().unwrap_or(&self.attack)
    }
}

/// Builder for [`TrainerConfig`].
#[derive(Debug, Default)]
pub struct TrainerConfigBuilder {
    mix: Option<BatchMix>,
    clean_weight: Option<f32>,
    robust_weight: Option<f32>,
    attack: Option<AttackConfig>,
    eval_attack: Option<AttackConfig>,
    nan_escalation: Option<usize>,
    seed: Option<u64>,
    checkpoint: Option<CheckpointPolicy>,
}

impl TrainerConfigBuilder {
    /// Sets the batch mixing policy.
    #[must_use]
    pub fn mix(mut self, mix: BatchMix) -> Self {
        self.mix = Some(mix);
        self
    }

    /// Sets the clean loss weight.
    #[must_use]
    pub fn clean_weight(mut self, w: f32) -> Self {
        self.clean_weight = Some(w);
        self
    }

    /// Sets the robust loss weight.
    #[must_use]
    pub fn robust_weight(mut self, w: f32) -> Self {
        self.robust_weight = Some(w);
        self
    }

    /// Sets the training attack.
    #[must_use]
    pub fn attack(mut self, attack: AttackConfig) -> Self {
        self.attack = Some(attack);
        self
    }

    /// Sets a distinct evaluation attack.
    #[must_use]
    pub fn eval_attack(mut self, attack: AttackConfig) -> Self {
        self.eval_attack = Some(attack);
        self
    }

    /// Sets the consecutive-NaN abort threshold.
    #[must_use]
    pub fn nan_escalation(mut self, n: usize) -> Self {
        self.nan_escalation = Some(n);
        self
    }

    /// Sets the root seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the checkpoint policy.
    #[must_use]
    pub fn checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = Some(policy);
        self
    }

    /// Builds the configuration.
    ///
    /// # Panics
    ///
    /// Panics if no attack was set; every trainer needs one.
    #[must_use]
    pub fn build(self) -> TrainerConfig {
        TrainerConfig {
            mix: self.mix.unwrap_or_else(default_mix),
            clean_weight: self.clean_weight.unwrap_or_else(default_clean_weight),
            robust_weight: self.robust_weight.unwrap_or_else(default_robust_weight),
            attack: self.attack.expect("TrainerConfigBuilder requires an attack"),
            eval_attack: self.eval_attack,
            nan_escalation: self.nan_escalation.unwrap_or_else(default_nan_escalation),
            seed: self.seed.unwrap_or_else(default_seed),
            checkpoint: self.checkpoint.unwrap_or_default(),
        }
    }
}

/// Configuration for the distributed coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Minimum live workers required to complete a round.
    #[serde(default = "default_quorum")]
    pub quorum: usize,

    /// Expected heartbeat cadence per worker, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A worker missing heartbeats for longer than this is marked departed.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Leader-side bound on gradient collection per round.
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Rounds cancelled for missing quorum are retried with the next seed
    /// at most this many times before the failure becomes fatal.
    #[serde(default = "default_max_round_retries")]
    pub max_round_retries: u32,
}

fn default_quorum() -> usize {
    1
}
fn default_heartbeat_interval_ms() -> u64 {
    100
}
fn default_heartbeat_timeout_ms() -> u64 {
    500
}
fn default_round_timeout_ms() -> u64 {
    5_000
}
fn default_max_round_retries() -> u32 {
    3
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            quorum: default_quorum(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            round_timeout_ms: default_round_timeout_ms(),
            max_round_retries: default_max_round_retries(),
        }
    }
}

impl CoordinatorConfig {
    /// Validates the coordinator parameters.
    pub fn validate(&self) -> Result<()> {
        if self.quorum == 0 {
            return Err(TrainError::Config("quorum must be at least 1".to_string()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(TrainError::Config(format!(
                "heartbeat timeout ({} ms) must exceed the heartbeat interval ({} ms)",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::NormKind;

    fn constraint() -> ConstraintSpec {
        ConstraintSpec::new(NormKind::Linf, 0.03, (0.0, 1.0)).unwrap()
    }

    #[test]
    fn builder_defaults_to_always_adversarial() {
        let config = TrainerConfig::builder()
            .attack(AttackConfig::fgsm(constraint(), 0.03))
            .build();
        assert_eq!(config.mix, BatchMix::Always);
        assert_eq!(config.nan_escalation, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_weights_rejected() {
        let config = TrainerConfig::builder()
            .attack(AttackConfig::fgsm(constraint(), 0.03))
            .clean_weight(0.0)
            .robust_weight(0.0)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn mix_probability_out_of_range_rejected() {
        let config = TrainerConfig::builder()
            .attack(AttackConfig::fgsm(constraint(), 0.03))
            .mix(BatchMix::Probability(1.5))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_step_size_rejected() {
        let mut attack = AttackConfig::fgsm(constraint(), 0.03);
        attack.step_size = -1.0;
        assert!(attack.validate().is_err());
    }

    #[test]
    fn eval_attack_falls_back_to_training_attack() {
        let config = TrainerConfig::builder()
            .attack(AttackConfig::fgsm(constraint(), 0.03))
            .build();
        assert_eq!(config.eval_attack().strategy, "fgsm");
    }

    #[test]
    fn coordinator_rejects_timeout_below_interval() {
        let config = CoordinatorConfig {
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 100,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = TrainerConfig::builder()
            .attack(AttackConfig::pgd(constraint(), 0.01, 20))
            .mix(BatchMix::Probability(0.5))
            .build();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: TrainerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
