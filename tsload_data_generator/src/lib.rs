//! Synthetic time-series points described by a JSON [`DataSpec`].
//!
//! A spec lists measurements, each with tags (fixed values, cardinality,
//! copies) and typed fields (fixed, random or sequential values). A
//! [`Generator`] walks the spec sample by sample from a start time, using a
//! seeded RNG so the same seed always yields the same points.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod generator;
pub mod specification;

pub use generator::{Generator, GeneratorConfig, SimulatedPoint, Value};
pub use specification::DataSpec;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read data spec {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse data spec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid data spec: {0}")]
    InvalidSpec(String),
}
