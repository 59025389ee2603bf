//! Target-agnostic building blocks of the write-load benchmark.
//!
//! A load target (a concrete time-series write API) plugs into the generic
//! [`loader::BenchmarkRunner`] by implementing [`Benchmark`], which hands out
//! the pieces the runner wires together:
//!
//! ```text
//! DataSource -> PointIndexer -> per-partition Batch -> Processor -> write API
//! ```
//!
//! The runner owns scheduling: it creates one worker per partition, feeds
//! each worker batches of the points the [`PointIndexer`] assigned to it and
//! collects the per-worker outcome.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod backoff;
mod headers;
pub mod indexer;
pub mod loader;

use std::{fmt::Debug, num::NonZeroUsize, ops::AddAssign};

use async_trait::async_trait;

pub use headers::{DEFAULT_TAG_TYPE, Headers};

/// Boxed error used at the seams between the generic loader and a target.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// A lazy, finite or infinite, stream of points.
///
/// `Ok(None)` signals the end of the stream and is not an error.
pub trait DataSource: Debug + Send + 'static {
    type Point: Send + 'static;

    /// The schema of every point this source yields.
    fn headers(&self) -> &Headers;

    /// Read the next point.
    fn next_item(&mut self) -> Result<Option<Self::Point>, DynError>;
}

/// A bounded group of points destined for one partition.
pub trait Batch: Debug + Send + 'static {
    type Point;

    /// Number of points appended so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&mut self, point: Self::Point);
}

/// Hands out empty batches, typically from a pool of reusable ones.
pub trait BatchFactory: Debug + Send + Sync + 'static {
    type Batch: Batch;

    fn new_batch(&self) -> Self::Batch;

    /// Give back a batch that will not be flushed, e.g. after a cancelled run.
    fn recycle(&self, batch: Self::Batch);
}

/// Extracts the raw bytes a point is partitioned by.
pub trait HashProvider<P>: Debug + Send + Sync {
    fn hash_key<'a>(&self, point: &'a P) -> &'a [u8];
}

/// Maps a point to a partition index in `[0, max_partitions)`.
pub trait PointIndexer<P>: Debug + Send + Sync {
    fn index(&self, point: &P) -> usize;
}

/// Counters describing what a processor wrote for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedBatch {
    /// Individual values (records) written.
    pub metrics: u64,
    /// Points written.
    pub rows: u64,
    /// Write calls issued.
    pub requests: u64,
    /// Encoded payload size of the issued write calls.
    pub bytes: u64,
}

impl AddAssign for ProcessedBatch {
    fn add_assign(&mut self, rhs: Self) {
        self.metrics += rhs.metrics;
        self.rows += rhs.rows;
        self.requests += rhs.requests;
        self.bytes += rhs.bytes;
    }
}

/// A batch that could not be (completely) flushed.
#[derive(Debug, thiserror::Error)]
#[error("batch of {rows} row(s) failed after {attempts} attempt(s): {source}")]
pub struct BatchFailure {
    /// Points in the failed batch.
    pub rows: u64,
    /// What was written before the failing call.
    pub written: ProcessedBatch,
    /// Attempts made for the failing call.
    pub attempts: usize,
    /// Whether the final error was a transient one that ran out of retries.
    pub retryable: bool,
    #[source]
    pub source: DynError,
}

/// Converts batches into write calls against the target.
///
/// A processor takes ownership of the batch and is responsible for returning
/// it to its pool once the flush completed, whatever the outcome.
#[async_trait]
pub trait Processor: Debug + Send + Sync + 'static {
    type Batch: Batch;

    /// Flush `batch`. With `do_load == false` the batch is encoded and counted
    /// but nothing is sent.
    async fn process_batch(
        &self,
        batch: Self::Batch,
        do_load: bool,
    ) -> Result<ProcessedBatch, BatchFailure>;
}

/// Creates and tears down the target database before a run.
#[async_trait]
pub trait DbCreator: Debug + Send + Sync {
    async fn db_exists(&self, db_name: &str) -> Result<bool, DynError>;

    /// Create the target, or confirm an existing one is usable.
    async fn create_db(&self, db_name: &str) -> Result<(), DynError>;

    /// Remove the target and everything in it.
    async fn remove_old_db(&self, db_name: &str) -> Result<(), DynError>;
}

/// A load target, assembled once per run.
pub trait Benchmark: Debug + Send {
    type Point: Send + 'static;
    type Source: DataSource<Point = Self::Point>;
    type Batch: Batch<Point = Self::Point>;
    type BatchFactory: BatchFactory<Batch = Self::Batch>;
    type Indexer: PointIndexer<Self::Point> + 'static;
    type Processor: Processor<Batch = Self::Batch>;
    type DbCreator: DbCreator;

    /// Hand over the data source; `None` once it has been taken.
    fn take_data_source(&mut self) -> Option<Self::Source>;

    fn batch_factory(&self) -> Self::BatchFactory;

    /// Build the indexer for `max_partitions` partitions.
    ///
    /// Fails when the configured partition key does not exist in the schema.
    fn point_indexer(&self, max_partitions: NonZeroUsize) -> Result<Self::Indexer, DynError>;

    /// A processor for one worker.
    fn processor(&self) -> Self::Processor;

    fn db_creator(&self) -> Self::DbCreator;
}
