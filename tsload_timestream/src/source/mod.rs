//! Where points come from: a replayed file or the simulator.

use std::path::PathBuf;

use tsload_data_generator::{DataSpec, GeneratorConfig};
use tsload_targets::{DataSource, DynError, Headers};

use crate::point::DeserializedPoint;

mod file;
mod simulator;

pub use file::FileDataSource;
pub use simulator::SimulatorDataSource;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("input does not start with a 'tags' header line")]
    MissingHeader,

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("could not create simulator: {0}")]
    Simulator(#[from] tsload_data_generator::Error),
}

/// Which source a run reads from.
#[derive(Debug, Clone)]
pub enum DataSourceConfig {
    /// Replay a file in the benchmark's text format; stdin when `None`.
    File { path: Option<PathBuf> },
    /// Generate points from a data spec.
    Simulator {
        spec: DataSpec,
        config: GeneratorConfig,
    },
}

/// The data sources of the Timestream target.
#[derive(Debug)]
pub enum TimestreamDataSource {
    File(FileDataSource),
    Simulator(SimulatorDataSource),
}

/// Build the configured source. With `use_current_time` every point is
/// stamped with the time it is read.
pub fn init_data_source(
    config: DataSourceConfig,
    use_current_time: bool,
) -> Result<TimestreamDataSource, SourceError> {
    match config {
        DataSourceConfig::File { path } => {
            FileDataSource::open(path.as_deref(), use_current_time).map(TimestreamDataSource::File)
        }
        DataSourceConfig::Simulator { spec, config } => {
            SimulatorDataSource::new(&spec, config, use_current_time)
                .map(TimestreamDataSource::Simulator)
        }
    }
}

impl DataSource for TimestreamDataSource {
    type Point = DeserializedPoint;

    fn headers(&self) -> &Headers {
        match self {
            Self::File(s) => s.headers(),
            Self::Simulator(s) => s.headers(),
        }
    }

    fn next_item(&mut self) -> Result<Option<DeserializedPoint>, DynError> {
        let point = match self {
            Self::File(s) => s.next_point()?,
            Self::Simulator(s) => s.next_point(),
        };
        Ok(point)
    }
}

/// Wall clock time in nanoseconds since the epoch.
fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
