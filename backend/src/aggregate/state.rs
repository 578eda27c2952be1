//! Aggregate state: moments, reservoir, per-worker counts

use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Running count, sum and sum of squares over every result ever seen.
///
/// O(1) memory; the exact basis for mean and variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MomentAccumulator {
    pub count: u64,
    pub sum: f64,
    pub sum_of_squares: f64,
}

impl MomentAccumulator {
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population variance, clamped at zero against rounding.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        let raw = self.sum_of_squares / self.count as f64 - mean * mean;
        Some(raw.max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

/// Fixed-capacity FIFO of the most recent results.
///
/// A display sample only; never used for mean or variance.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservoir {
    capacity: usize,
    values: VecDeque<f64>,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    /// Append, evicting and returning the oldest value when full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.values.len() == self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values in arrival order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

/// Everything the aggregator knows
#[derive(Debug, Clone)]
pub struct AggregateState {
    pub moments: MomentAccumulator,
    pub reservoir: Reservoir,
    pub per_worker: HashMap<String, u64>,
}

impl AggregateState {
    pub fn new(reservoir_capacity: usize) -> Self {
        Self {
            moments: MomentAccumulator::default(),
            reservoir: Reservoir::new(reservoir_capacity),
            per_worker: HashMap::new(),
        }
    }

    pub fn record(&mut self, worker_id: &str, value: f64) {
        self.reservoir.push(value);
        self.moments.add(value);
        match self.per_worker.get_mut(worker_id) {
            Some(count) => *count += 1,
            None => {
                self.per_worker.insert(worker_id.to_string(), 1);
            }
        }
    }
}
