//! Collective operations across data-parallel workers.
//!
//! The trainer and collator only see [`Communicator`]. [`SingleProcess`] is the
//! world-size-one group; [`LocalGroup`] runs several workers as threads of one
//! process and backs the multi-worker tests.

use crate::error::{TrainingError, TrainingResult};
use std::sync::{Arc, Barrier, Mutex};

/// Data-parallel process group.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Maximum of `value` over every rank.
    fn all_reduce_max(&self, value: u64) -> TrainingResult<u64>;

    /// `values` as held by `root`, on every rank.
    fn broadcast(&self, values: &[u64], root: usize) -> TrainingResult<Vec<u64>>;

    fn barrier(&self) -> TrainingResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_max(&self, value: u64) -> TrainingResult<u64> {
        Ok(value)
    }

    fn broadcast(&self, values: &[u64], root: usize) -> TrainingResult<Vec<u64>> {
        if root != 0 {
            return Err(TrainingError::Collective(format!(
                "broadcast root {root} outside a group of 1"
            )));
        }
        Ok(values.to_vec())
    }

    fn barrier(&self) -> TrainingResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct GroupState {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u64>>>,
}

/// One rank's handle on an in-process group.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    state: Arc<GroupState>,
}

impl LocalGroup {
    /// Handles for ranks `0..world_size`, to be moved onto one thread each.
    pub fn new(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let state = Arc::new(GroupState {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| Self { rank, world_size, state: Arc::clone(&state) })
            .collect()
    }

    fn publish(&self, values: &[u64]) -> TrainingResult<()> {
        let mut slots = self
            .state
            .slots
            .lock()
            .map_err(|_| TrainingError::Collective("process group state poisoned".to_string()))?;
        slots[self.rank] = values.to_vec();
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&[Vec<u64>]) -> T) -> TrainingResult<T> {
        let slots = self
            .state
            .slots
            .lock()
            .map_err(|_| TrainingError::Collective("process group state poisoned".to_string()))?;
        Ok(f(&slots))
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_max(&self, value: u64) -> TrainingResult<u64> {
        self.publish(&[value])?;
        self.state.barrier.wait();
        let max = self.read(|slots| slots.iter().filter_map(|s| s.first().copied()).max())?;
        // nobody republishes until every rank has read
        self.state.barrier.wait();
        max.ok_or_else(|| {
            TrainingError::Collective("all_reduce_max saw no contributions".to_string())
        })
    }

    fn broadcast(&self, values: &[u64], root: usize) -> TrainingResult<Vec<u64>> {
        if root >= self.world_size {
            return Err(TrainingError::Collective(format!(
                "broadcast root {root} outside a group of {}",
                self.world_size
            )));
        }
        if self.rank == root {
            self.publish(values)?;
        }
        self.state.barrier.wait();
        let out = self.read(|slots| slots[root].clone())?;
        self.state.barrier.wait();
        Ok(out)
    }

    fn barrier(&self) -> TrainingResult<()> {
        self.state.barrier.wait();
        Ok(())
    }
}
