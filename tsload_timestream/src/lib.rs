//! Load target for a Timestream-style managed time-series write API.
//!
//! Points are partitioned by the value of one dimension, batched per
//! partition and encoded into `WriteRecords` requests using one of two
//! strategies (see [`processor`]). Before a run the target database and one
//! table per measurement are created with the configured memory and magnetic
//! store retention.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod batch;
pub mod benchmark;
pub mod config;
pub mod db_creator;
pub mod indexer;
pub mod point;
pub mod processor;
pub mod source;
pub mod write_service;

pub use benchmark::TimestreamBenchmark;
pub use config::{ConfigError, RetentionProperties, TimestreamConfig};
pub use source::DataSourceConfig;
pub use write_service::{MemWriteService, WriteService};
