//! Global-batch sampling and the restartable dataloader.
//!
//! A global batch holds `global_batch_size` sample indices; each data-parallel
//! rank takes its contiguous slice. Iteration resumes from `consumed_samples`
//! and covers at most the remainder of one epoch.

use crate::config::{SamplerConfig, SamplerKind};
use crate::dataset::{Example, ExampleStore, SampleIndex};
use crate::error::{TrainingError, TrainingResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

/// Examples for this rank's share of one global batch.
pub type ExampleBatches = Box<dyn Iterator<Item = TrainingResult<Vec<Example>>> + Send>;

/// Restartable source of per-rank example batches.
pub trait BatchSource: Send {
    /// Examples per global batch, summed over every data-parallel rank.
    fn global_batch_size(&self) -> u64;

    /// Global batches left in the epoch when starting from zero consumed samples.
    fn num_batches(&self) -> u64;

    /// Global batches per epoch for step planning. Requires `drop_last`.
    fn global_batches_per_epoch(&self) -> TrainingResult<u64>;

    /// Whether successive epochs visit samples in a different order.
    fn reshuffles_each_epoch(&self) -> bool;

    fn iter_from(&self, consumed_samples: u64) -> ExampleBatches;
}

/// Megatron-style global-batch sampler over `total_samples` indices.
#[derive(Debug, Clone)]
pub struct GlobalBatchSampler {
    total_samples: u64,
    global_batch_size: u64,
    config: SamplerConfig,
}

impl GlobalBatchSampler {
    pub fn new(
        total_samples: u64,
        global_batch_size: u64,
        config: SamplerConfig,
    ) -> TrainingResult<Self> {
        config.validate(global_batch_size)?;
        if global_batch_size == 0 {
            return Err(TrainingError::Configuration("global_batch_size must be >= 1".to_string()));
        }
        Ok(Self { total_samples, global_batch_size, config })
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn global_batch_size(&self) -> u64 {
        self.global_batch_size
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Samples visited per epoch; the trailing partial batch is dropped with `drop_last`.
    pub fn active_samples(&self) -> u64 {
        if self.config.drop_last {
            self.total_samples - self.total_samples % self.global_batch_size
        } else {
            self.total_samples
        }
    }

    pub fn len(&self) -> u64 {
        let active = self.active_samples();
        if self.config.drop_last {
            active / self.global_batch_size
        } else {
            active.div_ceil(self.global_batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample order for the rest of the epoch that `consumed_samples` falls in.
    fn epoch_order(&self, consumed_samples: u64) -> Vec<u64> {
        let active = self.active_samples();
        if active == 0 {
            return Vec::new();
        }
        let epoch = consumed_samples / active;
        let offset = (consumed_samples % active) as usize;
        let mut order: Vec<u64> = (0..self.total_samples).collect();
        if self.config.kind == SamplerKind::Random {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order.truncate(active as usize);
        debug!(epoch, offset, active, "sampler epoch order");
        order.split_off(offset.min(order.len()))
    }

    /// Per-rank index batches from `consumed_samples` to the end of its epoch.
    pub fn rank_batches(&self, consumed_samples: u64) -> RankBatches {
        RankBatches {
            order: self.epoch_order(consumed_samples),
            position: 0,
            global_batch_size: self.global_batch_size as usize,
            data_parallel_size: self.config.data_parallel_size,
            data_parallel_rank: self.config.data_parallel_rank,
            pad_partial: self.config.pad_samples_to_global_batch_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankBatches {
    order: Vec<u64>,
    position: usize,
    global_batch_size: usize,
    data_parallel_size: usize,
    data_parallel_rank: usize,
    pad_partial: bool,
}

impl Iterator for RankBatches {
    type Item = Vec<SampleIndex>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.global_batch_size).min(self.order.len());
        let mut global: Vec<SampleIndex> =
            self.order[self.position..end].iter().map(|&i| SampleIndex::Item(i as usize)).collect();
        self.position = end;
        if global.len() < self.global_batch_size && self.pad_partial {
            global.resize(self.global_batch_size, SampleIndex::Padding);
        }

        let micro = self.global_batch_size / self.data_parallel_size;
        let start = (self.data_parallel_rank * micro).min(global.len());
        let stop = (start + micro).min(global.len());
        Some(global[start..stop].to_vec())
    }
}

/// Batches examples from a store through a [`GlobalBatchSampler`].
pub struct DataLoader {
    store: Arc<dyn ExampleStore>,
    sampler: GlobalBatchSampler,
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader").field("sampler", &self.sampler).finish_non_exhaustive()
    }
}

impl DataLoader {
    pub fn new(
        store: Arc<dyn ExampleStore>,
        global_batch_size: u64,
        config: SamplerConfig,
    ) -> TrainingResult<Self> {
        let sampler = GlobalBatchSampler::new(store.len() as u64, global_batch_size, config)?;
        Ok(Self { store, sampler })
    }

    pub fn sampler(&self) -> &GlobalBatchSampler {
        &self.sampler
    }
}

impl BatchSource for DataLoader {
    fn global_batch_size(&self) -> u64 {
        self.sampler.global_batch_size()
    }

    fn num_batches(&self) -> u64 {
        self.sampler.len()
    }

    fn global_batches_per_epoch(&self) -> TrainingResult<u64> {
        if !self.sampler.config().drop_last {
            return Err(TrainingError::Configuration(
                "drop_last=false is not supported when planning training steps".to_string(),
            ));
        }
        Ok(self.sampler.total_samples() / self.sampler.global_batch_size())
    }

    fn reshuffles_each_epoch(&self) -> bool {
        self.sampler.config().kind == SamplerKind::Random
    }

    fn iter_from(&self, consumed_samples: u64) -> ExampleBatches {
        let store = Arc::clone(&self.store);
        Box::new(self.sampler.rank_batches(consumed_samples).map(move |indices| {
            indices.into_iter().map(|index| store.produce_example(index)).collect()
        }))
    }
}
