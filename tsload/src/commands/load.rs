//! The `load` command: run the benchmark against the write service.

use std::{num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tsload_data_generator::{DataSpec, GeneratorConfig};
use tsload_targets::loader::{BenchmarkRunner, LoadSummary, LoaderConfig};
use tsload_timestream::{
    DataSourceConfig, MemWriteService, TimestreamBenchmark, TimestreamConfig, WriteService,
};

use crate::logging::LoggingConfig;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    loader: LoaderArgs,

    #[clap(flatten)]
    target: TimestreamConfig,

    #[clap(flatten)]
    source: SourceArgs,
}

/// Scheduling and policy flags of a run.
#[derive(Debug, clap::Parser)]
struct LoaderArgs {
    /// Name of the target database
    #[clap(long = "db-name", env = "TSLOAD_DB_NAME", default_value = "benchmark")]
    db_name: String,

    /// Points per batch
    #[clap(long = "batch-size", env = "TSLOAD_BATCH_SIZE", default_value = "10000")]
    batch_size: NonZeroUsize,

    /// Number of partitions, each loaded by its own worker
    #[clap(long = "workers", env = "TSLOAD_WORKERS", default_value = "1")]
    workers: NonZeroUsize,

    /// Stop after reading this many points
    #[clap(long = "limit", env = "TSLOAD_LIMIT")]
    limit: Option<u64>,

    /// Issue writes; when false points are only read, batched and encoded
    #[clap(
        long = "do-load",
        env = "TSLOAD_DO_LOAD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    do_load: bool,

    /// Create the target database and tables before loading
    #[clap(
        long = "do-create-db",
        env = "TSLOAD_DO_CREATE_DB",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    do_create_db: bool,

    /// Fail when the target database already exists
    #[clap(
        long = "do-abort-on-exist",
        env = "TSLOAD_DO_ABORT_ON_EXIST",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    do_abort_on_exist: bool,

    /// Remove an existing target database before creating it again
    #[clap(
        long = "recreate-db",
        env = "TSLOAD_RECREATE_DB",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    recreate_db: bool,

    /// Flush a partial batch once its oldest point waited this long, e.g. `1s`
    #[clap(
        long = "flush-interval",
        env = "TSLOAD_FLUSH_INTERVAL",
        value_parser = humantime::parse_duration
    )]
    flush_interval: Option<Duration>,

    /// Log progress this often, e.g. `10s`
    #[clap(
        long = "reporting-period",
        env = "TSLOAD_REPORTING_PERIOD",
        value_parser = humantime::parse_duration
    )]
    reporting_period: Option<Duration>,

    /// Stop the whole run on the first batch that fails for good
    #[clap(
        long = "abort-on-batch-failure",
        env = "TSLOAD_ABORT_ON_BATCH_FAILURE",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    abort_on_batch_failure: bool,

    /// Batches queued per partition before reading pauses
    #[clap(
        long = "channel-capacity",
        env = "TSLOAD_CHANNEL_CAPACITY",
        default_value = "2"
    )]
    channel_capacity: NonZeroUsize,
}

impl From<LoaderArgs> for LoaderConfig {
    fn from(args: LoaderArgs) -> Self {
        Self {
            db_name: args.db_name,
            batch_size: args.batch_size,
            workers: args.workers,
            limit: args.limit,
            do_load: args.do_load,
            do_create_db: args.do_create_db,
            do_abort_on_exist: args.do_abort_on_exist,
            recreate_db: args.recreate_db,
            flush_interval: args.flush_interval,
            reporting_period: args.reporting_period,
            abort_on_batch_failure: args.abort_on_batch_failure,
            channel_capacity: args.channel_capacity,
        }
    }
}

/// Where points come from.
#[derive(Debug, clap::Parser)]
struct SourceArgs {
    /// Data file to replay; `-` reads stdin, which is also the default
    #[clap(
        long = "file",
        env = "TSLOAD_FILE",
        conflicts_with = "simulator_spec"
    )]
    file: Option<PathBuf>,

    /// JSON data spec to generate points from instead of reading a file.
    ///
    /// `tsload spec` prints the builtin spec as a starting point.
    #[clap(long = "simulator-spec", env = "TSLOAD_SIMULATOR_SPEC")]
    simulator_spec: Option<PathBuf>,

    /// Seed of the simulator's random values
    #[clap(
        long = "simulator-seed",
        env = "TSLOAD_SIMULATOR_SEED",
        default_value_t = 1
    )]
    simulator_seed: u64,

    /// Time of the first simulated sample, in RFC3339 form; defaults to now
    #[clap(
        long = "simulator-start",
        env = "TSLOAD_SIMULATOR_START",
        value_parser = parse_start
    )]
    simulator_start: Option<DateTime<Utc>>,

    /// Time between simulated samples
    #[clap(
        long = "simulator-interval",
        env = "TSLOAD_SIMULATOR_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    simulator_interval: Duration,

    /// Stop simulating after this many points
    #[clap(long = "simulator-max-points", env = "TSLOAD_SIMULATOR_MAX_POINTS")]
    simulator_max_points: Option<u64>,
}

fn parse_start(s: &str) -> Result<DateTime<Utc>, humantime::TimestampError> {
    humantime::parse_rfc3339_weak(s).map(DateTime::<Utc>::from)
}

impl SourceArgs {
    fn data_source_config(self) -> Result<DataSourceConfig, anyhow::Error> {
        let Some(spec_path) = self.simulator_spec else {
            return Ok(DataSourceConfig::File { path: self.file });
        };

        let spec = DataSpec::from_path(&spec_path)
            .with_context(|| format!("failed to load data spec {}", spec_path.display()))?;
        let start = self.simulator_start.unwrap_or_else(Utc::now);
        let start_nanos = start
            .timestamp_nanos_opt()
            .context("simulator start time is out of range")?;

        Ok(DataSourceConfig::Simulator {
            spec,
            config: GeneratorConfig {
                seed: self.simulator_seed,
                start_nanos,
                interval: self.simulator_interval,
                max_points: self.simulator_max_points,
            },
        })
    }
}

pub(crate) async fn command(config: Config) -> Result<(), anyhow::Error> {
    let Config {
        logging_config: _,
        loader,
        target,
        source,
    } = config;

    let source = source.data_source_config()?;
    let loader = LoaderConfig::from(loader);

    let write_service: Arc<dyn WriteService> = Arc::new(MemWriteService::new());
    let benchmark = TimestreamBenchmark::new(&loader.db_name, target, source, write_service)
        .context("failed to set up the timestream target")?;

    let shutdown = CancellationToken::new();
    let signal_listener = tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = BenchmarkRunner::new(loader, benchmark)
        .with_shutdown(shutdown.clone())
        .run()
        .await;

    // stop listening for signals
    shutdown.cancel();
    let _ = signal_listener.await;

    let summary = result.context("load failed")?;
    print_summary(&summary);

    let failed = summary.failed_batches();
    if failed > 0 {
        bail!("{failed} batch(es) could not be written");
    }
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM, or return once it is cancelled.
async fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        res = wait_for_signal() => match res {
            Ok(()) => {
                warn!("stopping the load, in-flight batches complete");
                shutdown.cancel();
            }
            Err(e) => error!(error=%e, "failed to listen for shutdown signals"),
        },
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received SIGINT");
    Ok(())
}

fn print_summary(summary: &LoadSummary) {
    let written = summary.written();
    let secs = summary.elapsed.as_secs_f64();
    let workers = summary.workers.len();

    if summary.cancelled {
        println!("load stopped early after reading {} point(s)", summary.points_read);
    }
    println!(
        "loaded {} metrics in {secs:.3}sec with {workers} workers (mean rate {:.2} metrics/sec)",
        written.metrics,
        summary.metrics_per_sec()
    );
    println!(
        "loaded {} rows in {secs:.3}sec with {workers} workers (mean rate {:.2} rows/sec)",
        written.rows,
        summary.rows_per_sec()
    );
    println!(
        "issued {} write request(s), {} byte(s)",
        written.requests, written.bytes
    );
}
