//! Versioned checkpoints of training state.
//!
//! A checkpoint carries everything `restore_state` needs to resume
//! identically: model parameters, optimizer state, and the trainer's
//! epoch/step counters. Persistence (where files go, when old ones are
//! garbage-collected) belongs to the external operator layer; the
//! [`CheckpointManager`] here implements the interval/keep-last-N policy
//! that layer typically wants, with leader-only writes in distributed
//! runs handled by the coordinator.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CheckpointPolicy;
use crate::error::{Result, TrainError};
use crate::trainer::TrainState;

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

/// Provenance stamped into every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,
    /// Crate version that wrote it.
    pub crate_version: String,
}

impl CheckpointMetadata {
    fn now() -> Self {
        Self {
            created_at: Utc::now(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Complete snapshot for resuming a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainCheckpoint {
    /// Format version for compatibility checking on load.
    pub version: u32,
    /// Model parameter tensors in [`Model::parameters`](crate::Model::parameters) order.
    pub params: Vec<ArrayD<f32>>,
    /// Trainer state (epoch, step, optimizer state, best robust accuracy).
    pub state: TrainState,
    /// Provenance metadata.
    pub metadata: CheckpointMetadata,
}

impl TrainCheckpoint {
    /// Creates a checkpoint from a parameter snapshot and trainer state.
    #[must_use]
    pub fn new(params: Vec<ArrayD<f32>>, state: TrainState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            params,
            state,
            metadata: CheckpointMetadata::now(),
        }
    }

    /// Saves the checkpoint as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())
            .map_err(|e| TrainError::Checkpoint(format!("create failed: {e}")))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)
            .map_err(|e| TrainError::Checkpoint(format!("serialize failed: {e}")))
    }

    /// Loads a checkpoint, rejecting incompatible format versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| TrainError::Checkpoint(format!("open failed: {e}")))?;
        let reader = BufReader::new(file);
        let checkpoint: Self = serde_json::from_reader(reader)
            .map_err(|e| TrainError::Checkpoint(format!("deserialize failed: {e}")))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(TrainError::Checkpoint(format!(
                "version mismatch: file is v{}, expected v{CHECKPOINT_VERSION}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}

/// Interval-based checkpoint writer with keep-last-N pruning.
#[derive(Debug)]
pub struct CheckpointManager {
    directory: PathBuf,
    policy: CheckpointPolicy,
    written: VecDeque<PathBuf>,
    last_saved: Option<PathBuf>,
}

impl CheckpointManager {
    /// Creates the manager, ensuring the directory exists.
    pub fn new<P: Into<PathBuf>>(directory: P, policy: CheckpointPolicy) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|e| TrainError::Checkpoint(format!("create directory failed: {e}")))?;
        Ok(Self {
            directory,
            policy,
            written: VecDeque::new(),
            last_saved: None,
        })
    }

    /// Whether the policy calls for a save at the end of `epoch`
    /// (0-indexed).
    #[must_use]
    pub fn should_save(&self, epoch: u64) -> bool {
        self.policy.interval_epochs > 0 && (epoch + 1) % self.policy.interval_epochs == 0
    }

    /// Writes a checkpoint for `epoch` and prunes old files.
    pub fn save(&mut self, checkpoint: &TrainCheckpoint, epoch: u64) -> Result<PathBuf> {
        let path = self
            .directory
            .join(format!("{}_epoch_{epoch}.json", self.policy.prefix));
        checkpoint.save(&path)?;
        info!(epoch, path = %path.display(), "checkpoint saved");
        self.written.push_back(path.clone());
        self.last_saved = Some(path.clone());
        if self.policy.keep_last_n > 0 {
            while self.written.len() > self.policy.keep_last_n {
                if let Some(old) = self.written.pop_front() {
                    // Best effort; a missing file is not a training error.
                    let _ = std::fs::remove_file(old);
                }
            }
        }
        Ok(path)
    }

    /// The most recently written checkpoint, if any.
    #[must_use]
    pub fn last_saved(&self) -> Option<&Path> {
        self.last_saved.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::TrainState;
    use ndarray::ArrayD;

    fn checkpoint(step: u64) -> TrainCheckpoint {
        let params = vec![ArrayD::from_shape_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap()];
        let mut state = TrainState::new();
        state.step = step;
        TrainCheckpoint::new(params, state)
    }

    #[test]
    fn round_trip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.json");
        let original = checkpoint(17);
        original.save(&path).unwrap();
        let loaded = TrainCheckpoint::load(&path).unwrap();
        assert_eq!(loaded.state.step, 17);
        assert_eq!(loaded.params, original.params);
    }

    #[test]
    fn interval_policy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(
            dir.path(),
            CheckpointPolicy {
                interval_epochs: 2,
                keep_last_n: 0,
                prefix: "t".to_string(),
            },
        )
        .unwrap();
        assert!(!manager.should_save(0));
        assert!(manager.should_save(1));
        assert!(!manager.should_save(2));
        assert!(manager.should_save(3));
    }

    #[test]
    fn keep_last_n_prunes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(
            dir.path(),
            CheckpointPolicy {
                interval_epochs: 1,
                keep_last_n: 2,
                prefix: "t".to_string(),
            },
        )
        .unwrap();
        for epoch in 0..4 {
            manager.save(&checkpoint(epoch), epoch).unwrap();
        }
        assert!(!dir.path().join("t_epoch_0.json").exists());
        assert!(!dir.path().join("t_epoch_1.json").exists());
        assert!(dir.path().join("t_epoch_2.json").exists());
        assert!(dir.path().join("t_epoch_3.json").exists());
        assert_eq!(
            manager.last_saved().unwrap(),
            dir.path().join("t_epoch_3.json")
        );
    }

    #[test]
    fn disabled_interval_never_saves() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            CheckpointManager::new(dir.path(), CheckpointPolicy::default()).unwrap();
        assert!(!manager.should_save(0));
        assert!(!manager.should_save(99));
    }
}
