//! Wire protocol between the coordinator and its workers.
//!
//! The message set is language-neutral: any transport that preserves
//! these fields and delivers a round's `RoundStart` before its
//! `GradientSubmit`s satisfies the contract. In-process delivery uses
//! channels; the round number carried on every round-scoped message is
//! what enforces causal ordering: a submission tagged with a round the
//! leader has already closed is discarded.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Worker identifier assigned at registration.
pub type WorkerId = usize;

/// Coordinator/worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Leader → workers: a round is open. Carries the parameter snapshot
    /// every worker must attack against and the round's random seed, so
    /// all workers perturb under identical configuration and compatible
    /// randomness.
    RoundStart {
        /// Round number, monotonically increasing (aborted rounds consume
        /// a number).
        round: u64,
        /// Seed for this round's attack randomness.
        seed: u64,
        /// Version of the parameter snapshot.
        param_version: u64,
        /// The parameter snapshot itself.
        params: Vec<ArrayD<f32>>,
    },

    /// Worker → leader: local gradients for an open round.
    GradientSubmit {
        /// Round these gradients belong to.
        round: u64,
        /// Submitting worker.
        worker_id: WorkerId,
        /// Local gradient tensors in parameter order.
        gradients: Vec<ArrayD<f32>>,
        /// Examples in this worker's shard; the leader's weighting.
        shard_size: usize,
        /// Local loss, for aggregate reporting.
        loss: f32,
    },

    /// Worker → leader: liveness signal.
    Heartbeat {
        /// Reporting worker.
        worker_id: WorkerId,
        /// Sender's wall clock, milliseconds since the epoch. The leader
        /// judges staleness by its own monotonic clock and treats this as
        /// diagnostic only.
        timestamp_ms: u64,
    },

    /// Leader → workers: the round was cancelled; drop any work for it.
    RoundAbort {
        /// The cancelled round.
        round: u64,
        /// Why it was cancelled.
        reason: String,
    },
}

impl Message {
    /// The round this message belongs to, if it is round-scoped.
    #[must_use]
    pub fn round(&self) -> Option<u64> {
        match self {
            Message::RoundStart { round, .. }
            | Message::GradientSubmit { round, .. }
            | Message::RoundAbort { round, .. } => Some(*round),
            Message::Heartbeat { .. } => None,
        }
    }
}

/// Milliseconds since the Unix epoch, for heartbeat stamps.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
