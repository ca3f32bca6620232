//! Distributed coordination: leader-run rounds over trainer workers.
//!
//! One leader drives N workers, each computing combined clean/robust
//! gradients on its own data shard. Per round the leader broadcasts the
//! current parameter snapshot and a round seed, collects shard-weighted
//! gradients under a quorum-or-timeout rule, averages them, and applies
//! one optimizer step. All workers in a round see the same snapshot and
//! seed before any perturbation is generated, which is what keeps
//! random-start attacks from diverging across replicas.
//!
//! [`Coordinator`] holds the message-driven round logic (membership,
//! heartbeats, aggregation, bounded retries) with no threads of its own;
//! [`train_distributed`] is the in-process driver that wires it to
//! worker threads over channels. Leader failure is fatal; there is no
//! re-election here, and the operator layer restarts from the last
//! checkpoint via [`Coordinator::checkpoint_state`] /
//! [`Coordinator::restore_state`].

pub mod protocol;

pub use protocol::{now_ms, Message, WorkerId};

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use ndarray::ArrayD;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BatchMix, CoordinatorConfig, TrainerConfig};
use crate::data::{Batch, DataSource};
use crate::engine::AttackEngine;
use crate::error::{Result, TrainError};
use crate::trainer::combine_losses;
use crate::{Model, Optimizer};

/// Role a worker plays in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRole {
    /// Drives rounds, aggregates gradients, owns the optimizer step and
    /// checkpoint writes.
    Leader,
    /// Computes shard gradients and submits them.
    Follower,
}

/// Membership record for one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Worker id, assigned at registration.
    pub id: WorkerId,
    /// Leader or follower.
    pub role: WorkerRole,
    /// Examples in this worker's shard (its aggregation weight).
    pub shard_size: usize,
    /// Leader-clock time of the last message from this worker.
    pub last_heartbeat: Instant,
    /// Set once heartbeats lapse; departed workers are excluded from
    /// weighting and their in-flight gradients discarded.
    pub departed: bool,
}

/// A completed round's aggregate.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// The completed round number.
    pub round: u64,
    /// Shard-size-weighted mean gradients.
    pub gradients: Vec<ArrayD<f32>>,
    /// Shard-size-weighted mean loss.
    pub mean_loss: f32,
    /// Workers whose submissions were included, ascending by id.
    pub contributors: Vec<WorkerId>,
    /// Total examples across contributing shards.
    pub total_examples: usize,
}

/// Result of polling an open round.
#[derive(Debug)]
pub enum RoundPoll {
    /// Still collecting; quorum and timeout both unreached.
    Pending,
    /// Round complete; apply the optimizer step.
    Complete(RoundOutcome),
    /// Round cancelled; partial gradients were discarded. Begin the next
    /// round to retry with the next seed.
    Aborted {
        /// Why the round was cancelled.
        reason: String,
    },
}

/// Serializable coordinator progress for the checkpoint contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// Next round number.
    pub round: u64,
    /// Current parameter version.
    pub param_version: u64,
}

struct Submission {
    worker_id: WorkerId,
    gradients: Vec<ArrayD<f32>>,
    shard_size: usize,
    loss: f32,
}

/// Message-driven leader logic: membership, heartbeats, round
/// aggregation, bounded retries.
pub struct Coordinator {
    config: CoordinatorConfig,
    root_seed: u64,
    workers: Vec<WorkerHandle>,
    round: u64,
    param_version: u64,
    round_open: bool,
    round_started: Instant,
    retries_used: u32,
    pending: Vec<Submission>,
}

impl Coordinator {
    /// Creates a coordinator with a validated configuration.
    pub fn new(config: CoordinatorConfig, root_seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            root_seed,
            workers: Vec::new(),
            round: 0,
            param_version: 0,
            round_open: false,
            round_started: Instant::now(),
            retries_used: 0,
            pending: Vec::new(),
        })
    }

    /// Registers a worker and returns its id. The first registration
    /// becomes the leader.
    pub fn register_worker(&mut self, shard_size: usize) -> WorkerId {
        let id = self.workers.len();
        let role = if id == 0 {
            WorkerRole::Leader
        } else {
            WorkerRole::Follower
        };
        self.workers.push(WorkerHandle {
            id,
            role,
            shard_size,
            last_heartbeat: Instant::now(),
            departed: false,
        });
        info!(worker_id = id, ?role, shard_size, "worker registered");
        id
    }

    /// Current membership.
    #[must_use]
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Workers not marked departed.
    #[must_use]
    pub fn live_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| !w.departed)
            .map(|w| w.id)
            .collect()
    }

    /// Deterministic seed for a round, derived from the root seed so a
    /// restored coordinator replays the same sequence.
    #[must_use]
    pub fn round_seed(&self, round: u64) -> u64 {
        ChaCha8Rng::seed_from_u64(self.root_seed.wrapping_add(round)).gen()
    }

    /// Opens a round: discards any prior partial submissions and returns
    /// the `RoundStart` broadcast carrying the snapshot and seed.
    pub fn begin_round(&mut self, params: Vec<ArrayD<f32>>) -> Message {
        self.round += 1;
        self.round_open = true;
        self.round_started = Instant::now();
        self.pending.clear();
        let seed = self.round_seed(self.round);
        debug!(round = self.round, seed, "round started");
        Message::RoundStart {
            round: self.round,
            seed,
            param_version: self.param_version,
            params,
        }
    }

    /// Processes one worker message (heartbeat or gradient submission).
    /// Any message refreshes the sender's heartbeat. Submissions for
    /// closed rounds or from departed workers are discarded.
    pub fn handle(&mut self, msg: Message) {
        match msg {
            Message::Heartbeat { worker_id, .. } => self.touch(worker_id),
            Message::GradientSubmit {
                round,
                worker_id,
                gradients,
                shard_size,
                loss,
            } => {
                self.touch(worker_id);
                if !self.round_open || round != self.round {
                    debug!(worker_id, round, current = self.round, "stale submission dropped");
                    return;
                }
                if self.workers.get(worker_id).map_or(true, |w| w.departed) {
                    debug!(worker_id, round, "submission from departed worker dropped");
                    return;
                }
                if self.pending.iter().any(|s| s.worker_id == worker_id) {
                    return;
                }
                self.pending.push(Submission {
                    worker_id,
                    gradients,
                    shard_size,
                    loss,
                });
            }
            Message::RoundStart { .. } | Message::RoundAbort { .. } => {}
        }
    }

    fn touch(&mut self, worker_id: WorkerId) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if !worker.departed {
                worker.last_heartbeat = Instant::now();
            }
        }
    }

    /// Marks workers with lapsed heartbeats as departed, returning newly
    /// departed ids.
    pub fn sweep_heartbeats(&mut self, now: Instant) -> Vec<WorkerId> {
        let timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let mut departed = Vec::new();
        for worker in &mut self.workers {
            if !worker.departed && now.duration_since(worker.last_heartbeat) > timeout {
                worker.departed = true;
                departed.push(worker.id);
                warn!(worker_id = worker.id, "worker departed (heartbeat timeout)");
            }
        }
        departed
    }

    /// Polls the open round: completes it when every live worker has
    /// submitted (or quorum is met at the round timeout), cancels it when
    /// quorum is unreachable.
    ///
    /// # Errors
    ///
    /// [`TrainError::Coordination`] once the retry budget is exhausted.
    pub fn poll_round(&mut self, now: Instant) -> Result<RoundPoll> {
        if !self.round_open {
            return Ok(RoundPoll::Pending);
        }
        self.sweep_heartbeats(now);

        let live: Vec<WorkerId> = self.live_workers();
        let live_submissions = self
            .pending
            .iter()
            .filter(|s| live.contains(&s.worker_id))
            .count();
        let timed_out =
            now.duration_since(self.round_started) >= Duration::from_millis(self.config.round_timeout_ms);

        if live_submissions == live.len() && live_submissions >= self.config.quorum {
            return Ok(RoundPoll::Complete(self.complete_round(&live)));
        }
        if timed_out {
            if live_submissions >= self.config.quorum {
                return Ok(RoundPoll::Complete(self.complete_round(&live)));
            }
            return self.abort_round(format!(
                "quorum not reached: {live_submissions}/{} submissions, need {}",
                live.len(),
                self.config.quorum
            ));
        }
        if live.len() < self.config.quorum {
            return self.abort_round(format!(
                "only {} live workers, quorum is {}",
                live.len(),
                self.config.quorum
            ));
        }
        Ok(RoundPoll::Pending)
    }

    fn abort_round(&mut self, reason: String) -> Result<RoundPoll> {
        self.round_open = false;
        self.pending.clear();
        self.retries_used += 1;
        warn!(round = self.round, retries = self.retries_used, %reason, "round aborted");
        if self.retries_used > self.config.max_round_retries {
            return Err(TrainError::Coordination {
                round: self.round,
                reason: format!("retry budget exhausted after abort: {reason}"),
            });
        }
        Ok(RoundPoll::Aborted { reason })
    }

    fn complete_round(&mut self, live: &[WorkerId]) -> RoundOutcome {
        // Departed workers' in-flight gradients are dropped here; only
        // live submissions weigh in.
        let mut included: Vec<&Submission> = self
            .pending
            .iter()
            .filter(|s| live.contains(&s.worker_id))
            .collect();
        // Fixed accumulation order keeps aggregation bit-identical across
        // runs regardless of submission arrival order.
        included.sort_by_key(|s| s.worker_id);

        let total_examples: usize = included.iter().map(|s| s.shard_size).sum();
        let total_weight = total_examples.max(1) as f32;
        let mut gradients: Vec<ArrayD<f32>> = included[0]
            .gradients
            .iter()
            .map(|g| ArrayD::zeros(g.raw_dim()))
            .collect();
        let mut mean_loss = 0.0_f32;
        for submission in &included {
            let weight = submission.shard_size as f32 / total_weight;
            for (acc, grad) in gradients.iter_mut().zip(submission.gradients.iter()) {
                acc.zip_mut_with(grad, |a, &g| *a += weight * g);
            }
            mean_loss += weight * submission.loss;
        }

        let outcome = RoundOutcome {
            round: self.round,
            gradients,
            mean_loss,
            contributors: included.iter().map(|s| s.worker_id).collect(),
            total_examples,
        };
        self.round_open = false;
        self.pending.clear();
        self.retries_used = 0;
        self.param_version += 1;
        debug!(
            round = outcome.round,
            contributors = ?outcome.contributors,
            mean_loss = outcome.mean_loss,
            "round complete"
        );
        outcome
    }

    /// Coordinator progress for the external persistence layer.
    #[must_use]
    pub fn checkpoint_state(&self) -> CoordinatorState {
        CoordinatorState {
            round: self.round,
            param_version: self.param_version,
        }
    }

    /// Restores progress from a checkpoint; the seed sequence resumes
    /// deterministically from the restored round.
    pub fn restore_state(&mut self, state: &CoordinatorState) {
        self.round = state.round;
        self.param_version = state.param_version;
        self.round_open = false;
        self.pending.clear();
        self.retries_used = 0;
    }
}

/// Aggregate results of a distributed run.
#[derive(Debug, Clone)]
pub struct DistributedReport {
    /// Rounds completed (excludes aborted rounds).
    pub rounds_completed: u64,
    /// Mean loss of the final round.
    pub final_mean_loss: f32,
    /// Workers still live at the end.
    pub live_workers: Vec<WorkerId>,
}

/// Per-round worker decision, identical on every worker: the round seed
/// drives it, so the whole fleet perturbs (or doesn't) together.
fn round_is_adversarial(mix: BatchMix, round: u64, seed: u64) -> bool {
    match mix {
        BatchMix::Always => true,
        BatchMix::Alternate => round % 2 == 1,
        BatchMix::Probability(p) => ChaCha8Rng::seed_from_u64(seed).gen::<f32>() < p,
    }
}

fn worker_loop<M: Model, D: DataSource>(
    id: WorkerId,
    mut model: M,
    config: TrainerConfig,
    shard: D,
    rx: &mpsc::Receiver<Message>,
    to_leader: &mpsc::Sender<Message>,
) {
    let mut engine = match AttackEngine::new(config.attack.clone(), config.seed) {
        Ok(engine) => engine,
        Err(err) => {
            warn!(worker_id = id, %err, "worker failed to build attack engine");
            return;
        }
    };
    let shard_size = shard.shard_size();
    let mut epoch = 0_u64;
    let mut batches: Vec<Batch> = shard.epoch_batches(epoch).collect();
    let mut cursor = 0_usize;

    while let Ok(msg) = rx.recv() {
        match msg {
            Message::RoundStart {
                round,
                seed,
                params,
                ..
            } => {
                let _ = to_leader.send(Message::Heartbeat {
                    worker_id: id,
                    timestamp_ms: now_ms(),
                });
                if let Err(err) = model.set_parameters(&params) {
                    warn!(worker_id = id, round, %err, "snapshot rejected");
                    continue;
                }
                // Same broadcast seed, distinct per-worker stream.
                engine.reseed(seed.wrapping_add(id as u64));

                if cursor >= batches.len() {
                    epoch += 1;
                    batches = shard.epoch_batches(epoch).collect();
                    cursor = 0;
                }
                let Some(batch) = batches.get(cursor) else {
                    continue;
                };
                cursor += 1;

                let adversarial = round_is_adversarial(config.mix, round, seed);
                let attack_outcome = if adversarial {
                    match engine.perturb(&mut model, batch) {
                        Ok(outcome) => Some(outcome),
                        Err(err) => {
                            warn!(worker_id = id, round, %err, "attack failed, skipping round");
                            continue;
                        }
                    }
                } else {
                    None
                };
                match combine_losses(
                    &model,
                    batch,
                    attack_outcome.as_ref(),
                    config.clean_weight,
                    config.robust_weight,
                ) {
                    Ok((loss, gradients, _)) => {
                        let _ = to_leader.send(Message::GradientSubmit {
                            round,
                            worker_id: id,
                            gradients,
                            shard_size,
                            loss,
                        });
                    }
                    Err(err) => {
                        warn!(worker_id = id, round, %err, "loss failed, skipping round");
                    }
                }
            }
            Message::RoundAbort { round, .. } => {
                debug!(worker_id = id, round, "round abort received");
            }
            Message::GradientSubmit { .. } | Message::Heartbeat { .. } => {}
        }
    }
}

/// In-process distributed training: spawns one thread per shard, runs
/// `rounds` coordination rounds, and returns the trained model and
/// optimizer together with a report.
///
/// The calling thread is the leader. Worker threads receive each round's
/// snapshot and seed over a channel, compute combined gradients on their
/// shard, and submit; the leader aggregates and steps.
pub fn train_distributed<M, O, D>(
    mut model: M,
    mut optimizer: O,
    trainer_config: TrainerConfig,
    coordinator_config: CoordinatorConfig,
    shards: Vec<D>,
    rounds: u64,
) -> Result<(M, O, DistributedReport)>
where
    M: Model + Clone + 'static,
    O: Optimizer,
    D: DataSource + 'static,
{
    trainer_config.validate()?;
    if shards.is_empty() {
        return Err(TrainError::Config(
            "distributed training requires at least one shard".to_string(),
        ));
    }
    let mut coordinator = Coordinator::new(coordinator_config, trainer_config.seed)?;

    let (to_leader, from_workers) = mpsc::channel::<Message>();
    let mut worker_txs = Vec::new();
    let mut handles = Vec::new();
    for shard in shards {
        let id = coordinator.register_worker(shard.shard_size());
        let (tx, rx) = mpsc::channel::<Message>();
        worker_txs.push(tx);
        let to_leader = to_leader.clone();
        let config = trainer_config.clone();
        let worker_model = model.clone();
        handles.push(thread::spawn(move || {
            worker_loop(id, worker_model, config, shard, &rx, &to_leader);
        }));
    }
    drop(to_leader);

    let mut completed = 0_u64;
    let mut final_mean_loss = 0.0_f32;
    let result = loop {
        if completed >= rounds {
            break Ok(());
        }
        let start = coordinator.begin_round(model.parameters());
        for tx in &worker_txs {
            let _ = tx.send(start.clone());
        }
        let step_result = loop {
            while let Ok(msg) = from_workers.recv_timeout(Duration::from_millis(1)) {
                coordinator.handle(msg);
            }
            match coordinator.poll_round(Instant::now()) {
                Ok(RoundPoll::Pending) => {}
                Ok(RoundPoll::Complete(outcome)) => break Ok(Some(outcome)),
                Ok(RoundPoll::Aborted { reason }) => {
                    let abort = Message::RoundAbort {
                        round: coordinator.round,
                        reason,
                    };
                    for tx in &worker_txs {
                        let _ = tx.send(abort.clone());
                    }
                    break Ok(None);
                }
                Err(err) => break Err(err),
            }
        };
        match step_result {
            Ok(Some(outcome)) => {
                let mut params = model.parameters();
                optimizer.step(&mut params, &outcome.gradients)?;
                model.set_parameters(&params)?;
                final_mean_loss = outcome.mean_loss;
                completed += 1;
            }
            Ok(None) => {} // retried with the next seed on the next begin_round
            Err(err) => break Err(err),
        }
    };

    drop(worker_txs);
    for handle in handles {
        let _ = handle.join();
    }
    result?;

    let report = DistributedReport {
        rounds_completed: completed,
        final_mean_loss,
        live_workers: coordinator.live_workers(),
    };
    info!(
        rounds = report.rounds_completed,
        final_mean_loss = report.final_mean_loss,
        "distributed training finished"
    );
    Ok((model, optimizer, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            quorum: 2,
            heartbeat_interval_ms: 10,
            heartbeat_timeout_ms: 50,
            round_timeout_ms: 10_000,
            max_round_retries: 2,
        }
    }

    fn grad(value: f32) -> Vec<ArrayD<f32>> {
        vec![ArrayD::from_shape_vec(vec![2], vec![value, value]).unwrap()]
    }

    fn submit(worker_id: WorkerId, round: u64, value: f32, shard_size: usize) -> Message {
        Message::GradientSubmit {
            round,
            worker_id,
            gradients: grad(value),
            shard_size,
            loss: value,
        }
    }

    #[test]
    fn first_worker_is_leader() {
        let mut c = Coordinator::new(config(), 0).unwrap();
        c.register_worker(4);
        c.register_worker(4);
        assert_eq!(c.workers()[0].role, WorkerRole::Leader);
        assert_eq!(c.workers()[1].role, WorkerRole::Follower);
    }

    #[test]
    fn round_completes_with_weighted_average() {
        let mut c = Coordinator::new(config(), 0).unwrap();
        c.register_worker(3);
        c.register_worker(1);
        c.begin_round(vec![]);
        c.handle(submit(0, 1, 1.0, 3));
        c.handle(submit(1, 1, 5.0, 1));
        match c.poll_round(Instant::now()).unwrap() {
            RoundPoll::Complete(outcome) => {
                // (3*1 + 1*5) / 4 = 2.0
                assert!((outcome.gradients[0][[0]] - 2.0).abs() < 1e-6);
                assert!((outcome.mean_loss - 2.0).abs() < 1e-6);
                assert_eq!(outcome.contributors, vec![0, 1]);
                assert_eq!(outcome.total_examples, 4);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn stale_submissions_are_dropped() {
        let mut c = Coordinator::new(config(), 0).unwrap();
        c.register_worker(1);
        c.register_worker(1);
        c.begin_round(vec![]);
        c.handle(submit(0, 99, 1.0, 1));
        assert!(matches!(
            c.poll_round(Instant::now()).unwrap(),
            RoundPoll::Pending
        ));
    }

    #[test]
    fn duplicate_submissions_are_ignored() {
        let mut c = Coordinator::new(config(), 0).unwrap();
        c.register_worker(1);
        c.register_worker(1);
        c.begin_round(vec![]);
        c.handle(submit(0, 1, 1.0, 1));
        c.handle(submit(0, 1, 100.0, 1));
        c.handle(submit(1, 1, 3.0, 1));
        match c.poll_round(Instant::now()).unwrap() {
            RoundPoll::Complete(outcome) => {
                assert!((outcome.gradients[0][[0]] - 2.0).abs() < 1e-6);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn retry_budget_exhaustion_is_fatal() {
        let mut c = Coordinator::new(
            CoordinatorConfig {
                round_timeout_ms: 0,
                max_round_retries: 1,
                ..config()
            },
            0,
        )
        .unwrap();
        c.register_worker(1);
        c.register_worker(1);

        c.begin_round(vec![]);
        assert!(matches!(
            c.poll_round(Instant::now()).unwrap(),
            RoundPoll::Aborted { .. }
        ));
        c.begin_round(vec![]);
        assert!(matches!(
            c.poll_round(Instant::now()),
            Err(TrainError::Coordination { .. })
        ));
    }

    #[test]
    fn round_seeds_are_deterministic_and_distinct() {
        let c = Coordinator::new(config(), 7).unwrap();
        let c2 = Coordinator::new(config(), 7).unwrap();
        assert_eq!(c.round_seed(1), c2.round_seed(1));
        assert_ne!(c.round_seed(1), c.round_seed(2));
    }

    #[test]
    fn checkpoint_state_round_trips() {
        let mut c = Coordinator::new(config(), 7).unwrap();
        c.register_worker(1);
        c.register_worker(1);
        c.begin_round(vec![]);
        c.handle(submit(0, 1, 1.0, 1));
        c.handle(submit(1, 1, 1.0, 1));
        let RoundPoll::Complete(_) = c.poll_round(Instant::now()).unwrap() else {
            panic!("round should complete");
        };
        let state = c.checkpoint_state();

        let mut restored = Coordinator::new(config(), 7).unwrap();
        restored.register_worker(1);
        restored.register_worker(1);
        restored.restore_state(&state);
        assert_eq!(restored.checkpoint_state(), state);
        // seed sequence continues identically after restore
        assert_eq!(restored.round_seed(2), c.round_seed(2));
    }

    #[test]
    fn validate_catches_zero_quorum() {
        let bad = CoordinatorConfig {
            quorum: 0,
            ..config()
        };
        assert!(Coordinator::new(bad, 0).is_err());
    }
}
