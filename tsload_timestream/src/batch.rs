//! Batches of points and the pool they are recycled through.

use std::sync::Arc;

use parking_lot::Mutex;
use tsload_targets::{Batch, BatchFactory};

use crate::point::DeserializedPoint;

/// Idle batches a pool keeps by default.
pub const DEFAULT_MAX_IDLE_BATCHES: usize = 64;

/// The points of one partition waiting to be flushed.
#[derive(Debug, Default)]
pub struct TimestreamBatch {
    points: Vec<DeserializedPoint>,
    metrics: u64,
}

impl TimestreamBatch {
    pub fn points(&self) -> &[DeserializedPoint] {
        &self.points
    }

    /// Field values across all points, i.e. the records the batch encodes to.
    pub fn metrics(&self) -> u64 {
        self.metrics
    }

    /// Empty the batch, keeping its allocation.
    fn clear(&mut self) {
        self.points.clear();
        self.metrics = 0;
    }
}

impl Batch for TimestreamBatch {
    type Point = DeserializedPoint;

    fn len(&self) -> usize {
        self.points.len()
    }

    fn append(&mut self, point: DeserializedPoint) {
        self.metrics += point.fields().len() as u64;
        self.points.push(point);
    }
}

/// A free list of cleared batches, shared by the accumulator drawing batches and
/// the processors returning them.
#[derive(Debug)]
pub struct BatchPool {
    free: Mutex<Vec<TimestreamBatch>>,
    max_idle: usize,
}

impl Default for BatchPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_BATCHES)
    }
}

impl BatchPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn get(&self) -> TimestreamBatch {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return `batch` to the pool. Beyond `max_idle` idle batches it is
    /// dropped instead.
    pub fn put(&self, mut batch: TimestreamBatch) {
        batch.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(batch);
        }
    }

    /// Batches currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimestreamBatchFactory {
    pool: Arc<BatchPool>,
}

impl TimestreamBatchFactory {
    pub fn new(pool: Arc<BatchPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<BatchPool> {
        &self.pool
    }
}

impl BatchFactory for TimestreamBatchFactory {
    type Batch = TimestreamBatch;

    fn new_batch(&self) -> TimestreamBatch {
        self.pool.get()
    }

    fn recycle(&self, batch: TimestreamBatch) {
        self.pool.put(batch);
    }
}
