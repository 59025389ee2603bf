//! Log initialization and its CLI flags.

use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, writer::BoxMakeWriter},
    prelude::*,
};

/// Filter used when neither `--log-filter` nor `-v` is given.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("cannot set global tracing subscriber: {0}")]
    SetGlobalDefault(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogFormat {
    /// human-readable, single line
    #[default]
    Full,
    /// human-readable, multi line
    Pretty,
    /// machine-parseable
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogDestination {
    #[default]
    Stdout,
    Stderr,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,tsload_targets=info` specifies debug logging for all modules
    /// except for the loader which only displays info level logging.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER")]
    pub(crate) log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug'
    ///
    /// -vvv 'trace'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub(crate) log_verbose_count: u8,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum
    )]
    pub(crate) log_format: LogFormat,

    /// Logs: destination
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value_t = LogDestination::default(),
        value_enum
    )]
    pub(crate) log_destination: LogDestination,
}

impl LoggingConfig {
    /// The filter directive in effect; `-v` wins over `--log-filter`.
    pub(crate) fn filter_directive(&self) -> &str {
        match self.log_verbose_count {
            0 => self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Install the global subscriber described by `config`.
pub(crate) fn init(config: &LoggingConfig) -> Result<(), Error> {
    let filter = EnvFilter::try_new(config.filter_directive())?;

    let writer = match config.log_destination {
        LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = fmt::layer().with_writer(writer);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
        LogFormat::Full => fmt_layer.boxed(),
        LogFormat::Pretty => fmt_layer.pretty().boxed(),
        LogFormat::Json => fmt_layer.json().boxed(),
    };

    let subscriber = Registry::default().with(layer.with_filter(filter));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
