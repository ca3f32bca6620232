//! Batches and the dataset collaborator contract.
//!
//! Dataset loading and augmentation live outside the core: anything that
//! can hand out a finite, restartable sequence of [`Batch`]es per epoch
//! satisfies [`DataSource`]. Sharding by worker is the source's job; the
//! core only ever asks for "my shard for epoch E".
//!
//! [`InMemoryDataset`] is the bundled implementation used by workers over
//! pre-sharded tensors and by the test suite.

use ndarray::{ArrayD, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, TrainError};

/// One batch of labeled inputs. Immutable once produced; the trainer owns
/// it transiently for a single iteration.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input tensor with the batch along axis 0.
    pub inputs: ArrayD<f32>,
    /// Class label per example.
    pub labels: Vec<usize>,
}

impl Batch {
    /// Creates a batch, checking that labels line up with axis 0.
    pub fn new(inputs: ArrayD<f32>, labels: Vec<usize>) -> Result<Self> {
        if inputs.ndim() == 0 || inputs.len_of(Axis(0)) != labels.len() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![labels.len()],
                actual: inputs.shape().to_vec(),
            });
        }
        Ok(Self { inputs, labels })
    }

    /// Number of examples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Collaborator contract for dataset access.
///
/// Implementations produce a finite, restartable batch sequence per epoch.
/// Calling [`DataSource::epoch_batches`] twice with the same epoch must
/// yield the same sequence.
pub trait DataSource: Send {
    /// Batches for this source's shard in the given epoch.
    fn epoch_batches(&self, epoch: u64) -> Box<dyn Iterator<Item = Batch> + Send + '_>;

    /// Total number of examples in this shard.
    fn shard_size(&self) -> usize;
}

/// A dataset held fully in memory, optionally shuffled per epoch with a
/// seed-derived order so that every restart of an epoch sees the same
/// permutation.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    inputs: ArrayD<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl InMemoryDataset {
    /// Creates an in-memory dataset.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] for a zero batch size and
    /// [`TrainError::ShapeMismatch`] if labels don't match axis 0.
    pub fn new(inputs: ArrayD<f32>, labels: Vec<usize>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainError::Config("batch size must be positive".to_string()));
        }
        if inputs.ndim() == 0 || inputs.len_of(Axis(0)) != labels.len() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![labels.len()],
                actual: inputs.shape().to_vec(),
            });
        }
        Ok(Self {
            inputs,
            labels,
            batch_size,
            shuffle_seed: None,
        })
    }

    /// Enables per-epoch shuffling derived from `seed`.
    #[must_use]
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Round-robin shard for one worker out of `num_workers`, the split a
    /// distributed sampler would hand this worker.
    pub fn shard(&self, worker_id: usize, num_workers: usize) -> Result<Self> {
        if num_workers == 0 || worker_id >= num_workers {
            return Err(TrainError::Config(format!(
                "worker id {worker_id} out of range for {num_workers} workers"
            )));
        }
        let indices: Vec<usize> = (worker_id..self.labels.len()).step_by(num_workers).collect();
        let inputs = self.inputs.select(Axis(0), &indices);
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Ok(Self {
            inputs,
            labels,
            batch_size: self.batch_size,
            shuffle_seed: self.shuffle_seed,
        })
    }

    fn epoch_order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.labels.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }
}

impl DataSource for InMemoryDataset {
    fn epoch_batches(&self, epoch: u64) -> Box<dyn Iterator<Item = Batch> + Send + '_> {
        let order = self.epoch_order(epoch);
        let batch_size = self.batch_size;
        let chunks: Vec<Vec<usize>> = order.chunks(batch_size).map(<[usize]>::to_vec).collect();
        Box::new(chunks.into_iter().map(move |chunk| {
            let inputs = self.inputs.select(Axis(0), &chunk);
            let labels = chunk.iter().map(|&i| self.labels[i]).collect();
            Batch { inputs, labels }
        }))
    }

    fn shard_size(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn dataset(n: usize, batch_size: usize) -> InMemoryDataset {
        let inputs =
            ArrayD::from_shape_vec(vec![n, 2], (0..2 * n).map(|v| v as f32).collect()).unwrap();
        let labels = (0..n).map(|i| i % 2).collect();
        InMemoryDataset::new(inputs, labels, batch_size).unwrap()
    }

    #[test]
    fn batches_cover_the_epoch() {
        let ds = dataset(10, 3);
        let batches: Vec<Batch> = ds.epoch_batches(0).collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches.iter().map(Batch::len).sum::<usize>(), 10);
        assert_eq!(batches[3].len(), 1);
    }

    #[test]
    fn epochs_are_restartable() {
        let ds = dataset(8, 4).with_shuffle(7);
        let a: Vec<Vec<usize>> = ds.epoch_batches(3).map(|b| b.labels).collect();
        let b: Vec<Vec<usize>> = ds.epoch_batches(3).map(|b| b.labels).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn shuffle_varies_by_epoch() {
        let ds = dataset(64, 64).with_shuffle(7);
        let a: Vec<usize> = ds.epoch_batches(0).flat_map(|b| b.labels).collect();
        let b: Vec<usize> = ds.epoch_batches(1).flat_map(|b| b.labels).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn shards_partition_the_dataset() {
        let ds = dataset(10, 4);
        let s0 = ds.shard(0, 3).unwrap();
        let s1 = ds.shard(1, 3).unwrap();
        let s2 = ds.shard(2, 3).unwrap();
        assert_eq!(s0.shard_size() + s1.shard_size() + s2.shard_size(), 10);
        assert_eq!(s0.shard_size(), 4);
    }

    #[test]
    fn shard_rejects_bad_worker_id() {
        let ds = dataset(4, 2);
        assert!(ds.shard(3, 3).is_err());
        assert!(ds.shard(0, 0).is_err());
    }

    #[test]
    fn batch_rejects_label_mismatch() {
        let inputs = ArrayD::from_shape_vec(vec![2, 2], vec![0.0; 4]).unwrap();
        assert!(Batch::new(inputs, vec![0, 1, 0]).is_err());
    }
}
