//! Config for the tokio runtime the loader runs on.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for the tokio runtime.
#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct TokioRuntimeConfig {
    /// Set the maximum number of runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-threads", env = "TSLOAD_NUM_THREADS", action)]
    pub(crate) num_threads: Option<NonZeroUsize>,

    /// Tokio runtime type.
    #[clap(
        long = "runtime-type",
        env = "TSLOAD_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub(crate) runtime_type: TokioRuntimeType,
}

impl TokioRuntimeConfig {
    /// Creates the tokio runtime builder.
    pub(crate) fn builder(&self) -> Result<tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here, logging is initialised later.
        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => tokio::runtime::Builder::new_multi_thread(),
        };

        builder.enable_time();
        builder.enable_io();

        let thread_counter = Arc::new(AtomicUsize::new(1));
        builder.thread_name_fn(move || {
            format!(
                "tsload tokio {}",
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        let num_threads = match self.num_threads {
            None => std::thread::available_parallelism()?,
            Some(n) => n,
        };
        if matches!(self.runtime_type, TokioRuntimeType::MultiThread) {
            builder.worker_threads(num_threads.get());
        }

        Ok(builder)
    }
}
