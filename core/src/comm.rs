//! Collective operations used by the solver and the pixel-domain accumulators.
//!
//! The core never talks to a message-passing library directly. Every worker
//! receives a [`Reducer`] and all cross-worker scalars and maps go through it.

use std::sync::{Arc, Barrier, Mutex};

pub trait Reducer: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sum over the group. Only the root (rank 0) receives the total, other
    /// ranks get zero.
    fn reduce_sum(&self, value: f64) -> f64;

    /// Sum over the group, identical on every rank.
    fn all_reduce_sum(&self, value: f64) -> f64;

    /// Element-wise sum of equally sized buffers, written back on every rank.
    fn all_reduce_slice(&self, values: &mut [f64]);

    /// Overwrite `values` on every rank with the contents held by `root`.
    fn broadcast(&self, values: &mut [f64], root: usize);
}

/// Reducer for a single worker: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialReducer;

impl Reducer for SerialReducer {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn reduce_sum(&self, value: f64) -> f64 {
        value
    }

    fn all_reduce_sum(&self, value: f64) -> f64 {
        value
    }

    fn all_reduce_slice(&self, _values: &mut [f64]) {}

    fn broadcast(&self, _values: &mut [f64], _root: usize) {}
}

struct GroupState {
    slots: Mutex<Vec<Vec<f64>>>,
    deposited: Barrier,
    collected: Barrier,
}

/// Reducer shared by in-process workers running on separate threads.
///
/// Each collective deposits the local contribution in the caller's slot,
/// waits for the whole group and then combines the slots in rank order, so
/// the result does not depend on thread scheduling.
pub struct ThreadGroupReducer {
    rank: usize,
    size: usize,
    state: Arc<GroupState>,
}

impl ThreadGroupReducer {
    /// Creates one reducer per rank of a group with `size` members.
    pub fn group(size: usize) -> Vec<ThreadGroupReducer> {
        let size = size.max(1);
        let state = Arc::new(GroupState {
            slots: Mutex::new(vec![Vec::new(); size]),
            deposited: Barrier::new(size),
            collected: Barrier::new(size),
        });
        (0..size)
            .map(|rank| ThreadGroupReducer {
                rank,
                size,
                state: Arc::clone(&state),
            })
            .collect()
    }

    fn all_gather(&self, contribution: &[f64]) -> Vec<Vec<f64>> {
        {
            let mut slots = self
                .state
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots[self.rank] = contribution.to_vec();
        }
        self.state.deposited.wait();
        let gathered = self
            .state
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        self.state.collected.wait();
        gathered
    }
}

impl Reducer for ThreadGroupReducer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce_sum(&self, value: f64) -> f64 {
        let total = self.all_reduce_sum(value);
        if self.rank == 0 {
            total
        } else {
            0.0
        }
    }

    fn all_reduce_sum(&self, value: f64) -> f64 {
        self.all_gather(&[value])
            .iter()
            .map(|slot| slot.first().copied().unwrap_or(0.0))
            .sum()
    }

    fn all_reduce_slice(&self, values: &mut [f64]) {
        let gathered = self.all_gather(values);
        values.iter_mut().for_each(|value| *value = 0.0);
        for slot in &gathered {
            for (value, contribution) in values.iter_mut().zip(slot) {
                *value += contribution;
            }
        }
    }

    fn broadcast(&self, values: &mut [f64], root: usize) {
        let gathered = self.all_gather(values);
        if let Some(source) = gathered.get(root) {
            for (value, incoming) in values.iter_mut().zip(source) {
                *value = *incoming;
            }
        }
    }
}
