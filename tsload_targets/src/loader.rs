//! The generic load runner: wires a [`Benchmark`]'s pieces into a source
//! reader and a batch accumulator feeding one worker task per partition.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Batch, BatchFactory, BatchFailure, Benchmark, DataSource, DbCreator, DynError, PointIndexer,
    ProcessedBatch, Processor,
};

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the data source has already been consumed")]
    SourceTaken,

    #[error("database '{0}' already exists and the run is configured to abort on an existing database")]
    DbExists(String),

    #[error("failed to check whether database '{db_name}' exists: {source}")]
    DbExistsCheck {
        db_name: String,
        #[source]
        source: DynError,
    },

    #[error("failed to remove old database '{db_name}': {source}")]
    RemoveDb {
        db_name: String,
        #[source]
        source: DynError,
    },

    #[error("failed to create database '{db_name}': {source}")]
    CreateDb {
        db_name: String,
        #[source]
        source: DynError,
    },

    #[error("could not create point indexer: {0}")]
    Indexer(#[source] DynError),

    #[error("failed reading from the data source after {points_read} point(s): {source}")]
    Source {
        points_read: u64,
        #[source]
        source: DynError,
    },

    #[error("worker {worker_id} aborted the run: {source}")]
    BatchFailed {
        worker_id: usize,
        #[source]
        source: BatchFailure,
    },

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("the source reader panicked")]
    ReaderPanicked,

    #[error("the batch accumulator panicked")]
    AccumulatorPanicked,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Points read ahead of the accumulator before the source reader waits.
const POINT_QUEUE_CAPACITY: usize = 1024;

/// Scheduling and policy knobs of a run.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Name of the target database.
    pub db_name: String,
    /// Points per batch.
    pub batch_size: NonZeroUsize,
    /// Number of partitions, and therefore workers.
    pub workers: NonZeroUsize,
    /// Stop after reading this many points.
    pub limit: Option<u64>,
    /// Issue writes; when false points are only scanned, batched and encoded.
    pub do_load: bool,
    /// Create the target database before loading.
    pub do_create_db: bool,
    /// Fail the run when the target database already exists.
    pub do_abort_on_exist: bool,
    /// Tear an existing target down before creating it again.
    pub recreate_db: bool,
    /// Flush a partial batch once its first point is older than this.
    pub flush_interval: Option<Duration>,
    /// Log progress this often.
    pub reporting_period: Option<Duration>,
    /// Stop the whole run on the first failed batch.
    pub abort_on_batch_failure: bool,
    /// Batches queued per partition before the accumulator waits.
    pub channel_capacity: NonZeroUsize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            db_name: "benchmark".to_owned(),
            batch_size: NonZeroUsize::new(10_000).expect("non-zero"),
            workers: NonZeroUsize::MIN,
            limit: None,
            do_load: true,
            do_create_db: true,
            do_abort_on_exist: false,
            recreate_db: false,
            flush_interval: None,
            reporting_period: None,
            abort_on_batch_failure: false,
            channel_capacity: NonZeroUsize::new(2).expect("non-zero"),
        }
    }
}

/// The outcome of one worker.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub worker_id: usize,
    /// Batches handed to the processor.
    pub batches: u64,
    /// Everything written, including partial writes of failed batches.
    pub written: ProcessedBatch,
    pub failures: Vec<BatchFailure>,
}

/// The outcome of a run.
#[derive(Debug)]
pub struct LoadSummary {
    pub points_read: u64,
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
    /// The run was stopped before the source was exhausted.
    pub cancelled: bool,
}

impl LoadSummary {
    pub fn written(&self) -> ProcessedBatch {
        let mut total = ProcessedBatch::default();
        for w in &self.workers {
            total += w.written;
        }
        total
    }

    pub fn failed_batches(&self) -> usize {
        self.workers.iter().map(|w| w.failures.len()).sum()
    }

    pub fn rows_per_sec(&self) -> f64 {
        rate(self.written().rows, self.elapsed)
    }

    pub fn metrics_per_sec(&self) -> f64 {
        rate(self.written().metrics, self.elapsed)
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0. { count as f64 / secs } else { 0. }
}

/// Running totals shared between the workers and the progress reporter.
#[derive(Debug, Default)]
struct Progress {
    rows: AtomicU64,
    metrics: AtomicU64,
    bytes: AtomicU64,
}

impl Progress {
    fn record(&self, written: &ProcessedBatch) {
        self.rows.fetch_add(written.rows, Ordering::Relaxed);
        self.metrics.fetch_add(written.metrics, Ordering::Relaxed);
        self.bytes.fetch_add(written.bytes, Ordering::Relaxed);
    }
}

/// Drives one run of a [`Benchmark`].
#[derive(Debug)]
pub struct BenchmarkRunner<B> {
    config: LoaderConfig,
    benchmark: B,
    shutdown: CancellationToken,
}

impl<B> BenchmarkRunner<B>
where
    B: Benchmark,
{
    pub fn new(config: LoaderConfig, benchmark: B) -> Self {
        Self {
            config,
            benchmark,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the run when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// A token that stops the run when cancelled.
    ///
    /// In-flight flushes complete, nothing else is written.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Run the benchmark to completion.
    ///
    /// Setup failures are returned before any worker starts. Batch failures
    /// are collected in the [`WorkerReport`]s unless
    /// [`LoaderConfig::abort_on_batch_failure`] is set.
    pub async fn run(mut self) -> Result<LoadSummary> {
        let source = self
            .benchmark
            .take_data_source()
            .ok_or(Error::SourceTaken)?;
        // validated before the target is touched
        let indexer = self
            .benchmark
            .point_indexer(self.config.workers)
            .map_err(Error::Indexer)?;

        if self.config.do_load && self.config.do_create_db {
            self.prepare_target().await?;
        }

        let factory = Arc::new(self.benchmark.batch_factory());
        let progress = Arc::new(Progress::default());
        let start = Instant::now();

        info!(
            db_name = %self.config.db_name,
            workers = self.config.workers.get(),
            batch_size = self.config.batch_size.get(),
            do_load = self.config.do_load,
            "starting load"
        );

        let mut senders = Vec::with_capacity(self.config.workers.get());
        let mut handles = Vec::with_capacity(self.config.workers.get());
        for worker_id in 0..self.config.workers.get() {
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.get());
            senders.push(tx);

            let worker = Worker {
                worker_id,
                processor: self.benchmark.processor(),
                factory: Arc::clone(&factory),
                progress: Arc::clone(&progress),
                shutdown: self.shutdown.clone(),
                do_load: self.config.do_load,
                abort_on_batch_failure: self.config.abort_on_batch_failure,
            };
            handles.push(tokio::spawn(worker.run(rx)));
        }

        let reporter_shutdown = CancellationToken::new();
        let reporter = self.config.reporting_period.map(|period| {
            tokio::spawn(report_progress(
                period,
                Arc::clone(&progress),
                reporter_shutdown.clone(),
            ))
        });

        let (points_tx, points_rx) = mpsc::channel(POINT_QUEUE_CAPACITY);
        let accumulator = Accumulator {
            indexer,
            factory,
            senders,
            batch_size: self.config.batch_size.get(),
            flush_interval: self.config.flush_interval,
            shutdown: self.shutdown.clone(),
        };
        let accumulating = tokio::spawn(accumulator.run(points_rx));

        let reader = SourceReader {
            source,
            limit: self.config.limit,
            shutdown: self.shutdown.clone(),
        };
        // The source is synchronous and may block on I/O.
        let scanned = tokio::task::spawn_blocking(move || reader.read(points_tx)).await;
        let accumulated = accumulating.await;

        // The accumulator dropped the senders, so the workers drain their
        // queues and exit.
        let workers = join_workers(handles).await?;

        reporter_shutdown.cancel();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        if accumulated.is_err() {
            return Err(Error::AccumulatorPanicked);
        }
        let (points_read, source_exhausted) = match scanned {
            Ok(Ok(scan)) => (scan.points_read, scan.source_exhausted),
            Ok(Err((points_read, source))) => {
                error!(error=%source, points_read, "data source failed, load stopped");
                return Err(Error::Source {
                    points_read,
                    source,
                });
            }
            Err(_) => return Err(Error::ReaderPanicked),
        };

        let mut summary = LoadSummary {
            points_read,
            workers,
            elapsed: start.elapsed(),
            cancelled: self.shutdown.is_cancelled(),
        };

        if self.config.abort_on_batch_failure {
            if let Some(w) = summary.workers.iter_mut().find(|w| !w.failures.is_empty()) {
                return Err(Error::BatchFailed {
                    worker_id: w.worker_id,
                    source: w.failures.remove(0),
                });
            }
        }

        let written = summary.written();
        info!(
            points_read,
            source_exhausted,
            rows = written.rows,
            metrics = written.metrics,
            requests = written.requests,
            bytes = written.bytes,
            failed_batches = summary.failed_batches(),
            elapsed_secs = summary.elapsed.as_secs_f64(),
            rows_per_sec = summary.rows_per_sec(),
            metrics_per_sec = summary.metrics_per_sec(),
            "load finished"
        );

        Ok(summary)
    }

    async fn prepare_target(&self) -> Result<()> {
        let db_name = self.config.db_name.as_str();
        let creator = self.benchmark.db_creator();

        let exists = creator
            .db_exists(db_name)
            .await
            .map_err(|source| Error::DbExistsCheck {
                db_name: db_name.to_owned(),
                source,
            })?;

        if exists {
            if self.config.do_abort_on_exist {
                return Err(Error::DbExists(db_name.to_owned()));
            }
            if self.config.recreate_db {
                info!(%db_name, "removing old database");
                creator
                    .remove_old_db(db_name)
                    .await
                    .map_err(|source| Error::RemoveDb {
                        db_name: db_name.to_owned(),
                        source,
                    })?;
            }
        }

        creator
            .create_db(db_name)
            .await
            .map_err(|source| Error::CreateDb {
                db_name: db_name.to_owned(),
                source,
            })
    }
}

async fn join_workers(handles: Vec<JoinHandle<WorkerReport>>) -> Result<Vec<WorkerReport>> {
    let mut reports = Vec::with_capacity(handles.len());
    let mut panicked = None;
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(error=%e, worker_id, "worker did not complete");
                panicked.get_or_insert(worker_id);
            }
        }
    }

    match panicked {
        Some(worker_id) => Err(Error::WorkerPanicked(worker_id)),
        None => Ok(reports),
    }
}

async fn report_progress(period: Duration, progress: Arc<Progress>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;

    let mut last_rows = 0;
    let mut last_metrics = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let rows = progress.rows.load(Ordering::Relaxed);
        let metrics = progress.metrics.load(Ordering::Relaxed);
        info!(
            rows,
            metrics,
            bytes = progress.bytes.load(Ordering::Relaxed),
            rows_per_sec = rate(rows - last_rows, period),
            metrics_per_sec = rate(metrics - last_metrics, period),
            "load progress"
        );
        last_rows = rows;
        last_metrics = metrics;
    }
}

#[derive(Debug)]
struct ScanOutcome {
    points_read: u64,
    source_exhausted: bool,
}

/// Reads the source on a blocking thread and forwards every point to the
/// [`Accumulator`].
#[derive(Debug)]
struct SourceReader<S> {
    source: S,
    limit: Option<u64>,
    shutdown: CancellationToken,
}

impl<S> SourceReader<S>
where
    S: DataSource,
{
    /// Read until the source is exhausted, the limit is reached, the run is
    /// cancelled or the accumulator is gone.
    ///
    /// On error the number of points read so far is returned alongside it;
    /// the points read before the error are still batched and flushed.
    fn read(mut self, points: mpsc::Sender<S::Point>) -> Result<ScanOutcome, (u64, DynError)> {
        let mut points_read = 0;
        let mut source_exhausted = false;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.limit.is_some_and(|limit| points_read >= limit) {
                break;
            }

            match self.source.next_item() {
                Ok(Some(point)) => {
                    points_read += 1;
                    if points.blocking_send(point).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    source_exhausted = true;
                    break;
                }
                Err(e) => return Err((points_read, e)),
            }
        }

        debug!(points_read, source_exhausted, "source reader finished");
        Ok(ScanOutcome {
            points_read,
            source_exhausted,
        })
    }
}

/// Accumulates one batch per partition and hands full or expired batches to
/// the workers.
///
/// Runs as its own task so a partial batch is flushed once its time threshold
/// passes, even while the source is idle.
#[derive(Debug)]
struct Accumulator<I, F>
where
    F: BatchFactory,
{
    indexer: I,
    factory: Arc<F>,
    senders: Vec<mpsc::Sender<F::Batch>>,
    batch_size: usize,
    flush_interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl<I, F> Accumulator<I, F>
where
    F: BatchFactory,
{
    async fn run<P>(self, mut points: mpsc::Receiver<P>)
    where
        I: PointIndexer<P>,
        F::Batch: Batch<Point = P>,
    {
        let Self {
            indexer,
            factory,
            senders,
            batch_size,
            flush_interval,
            shutdown,
        } = self;
        let factory = &*factory;

        let mut pending: Vec<Option<(F::Batch, Instant)>> =
            senders.iter().map(|_| None).collect();

        loop {
            let deadline = flush_interval.and_then(|interval| {
                pending
                    .iter()
                    .flatten()
                    .map(|(_, started)| *started + interval)
                    .min()
            });

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = expiry(deadline) => {
                    let Some(interval) = flush_interval else { continue };
                    if !flush_expired(&mut pending, &senders, factory, interval).await {
                        break;
                    }
                }
                point = points.recv() => {
                    let Some(point) = point else { break };

                    let partition = indexer.index(&point);
                    let slot = &mut pending[partition];
                    let (batch, _) = slot.get_or_insert_with(|| (factory.new_batch(), Instant::now()));
                    batch.append(point);

                    if batch.len() >= batch_size {
                        if let Some((batch, _)) = slot.take() {
                            if !send(&senders[partition], batch, factory).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // stop the reader
        points.close();

        if shutdown.is_cancelled() {
            // nothing new is accepted once cancelled
            for (batch, _) in pending.into_iter().flatten() {
                factory.recycle(batch);
            }
        } else {
            for (partition, slot) in pending.into_iter().enumerate() {
                if let Some((batch, _)) = slot {
                    send(&senders[partition], batch, factory).await;
                }
            }
        }
        debug!("accumulator finished");
    }
}

/// Completes once `deadline` passed, never without one.
async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Hand `batch` to a worker, waiting for queue space.
///
/// Returns false when the worker is gone, which only happens once the run is
/// being shut down.
async fn send<F>(sender: &mpsc::Sender<F::Batch>, batch: F::Batch, factory: &F) -> bool
where
    F: BatchFactory,
{
    match sender.send(batch).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(batch)) => {
            factory.recycle(batch);
            false
        }
    }
}

/// Send every batch whose first point is at least `interval` old.
async fn flush_expired<F>(
    pending: &mut [Option<(F::Batch, Instant)>],
    senders: &[mpsc::Sender<F::Batch>],
    factory: &F,
    interval: Duration,
) -> bool
where
    F: BatchFactory,
{
    for (partition, slot) in pending.iter_mut().enumerate() {
        if slot
            .as_ref()
            .is_some_and(|(_, started)| started.elapsed() >= interval)
        {
            if let Some((batch, _)) = slot.take() {
                debug!(partition, rows = batch.len(), "flushing partial batch");
                if !send(&senders[partition], batch, factory).await {
                    return false;
                }
            }
        }
    }
    true
}

/// Owns one partition: flushes its batches one at a time, in order.
#[derive(Debug)]
struct Worker<P, F> {
    worker_id: usize,
    processor: P,
    factory: Arc<F>,
    progress: Arc<Progress>,
    shutdown: CancellationToken,
    do_load: bool,
    abort_on_batch_failure: bool,
}

impl<P, F> Worker<P, F>
where
    P: Processor,
    F: BatchFactory<Batch = P::Batch>,
{
    async fn run(self, mut rx: mpsc::Receiver<P::Batch>) -> WorkerReport {
        let mut report = WorkerReport {
            worker_id: self.worker_id,
            ..Default::default()
        };

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            report.batches += 1;
            match self.processor.process_batch(batch, self.do_load).await {
                Ok(written) => {
                    self.progress.record(&written);
                    report.written += written;
                }
                Err(failure) => {
                    warn!(
                        worker_id = self.worker_id,
                        error = %failure,
                        retryable = failure.retryable,
                        "batch failed"
                    );
                    self.progress.record(&failure.written);
                    report.written += failure.written;
                    report.failures.push(failure);

                    if self.abort_on_batch_failure {
                        self.shutdown.cancel();
                        break;
                    }
                }
            }
        }

        // Batches still queued are dropped unflushed.
        rx.close();
        let mut dropped = 0;
        while let Ok(batch) = rx.try_recv() {
            dropped += 1;
            self.factory.recycle(batch);
        }
        if dropped > 0 {
            warn!(worker_id = self.worker_id, dropped, "discarded queued batches on shutdown");
        }

        debug!(
            worker_id = self.worker_id,
            batches = report.batches,
            rows = report.written.rows,
            "worker finished"
        );
        report
    }
}
