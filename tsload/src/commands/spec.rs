//! The `spec` command: print the builtin simulator data spec.

use std::path::PathBuf;

use anyhow::Context;
use tsload_data_generator::DataSpec;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// Write the spec to this file instead of stdout
    #[clap(long = "output", short = 'o')]
    output: Option<PathBuf>,
}

pub(crate) fn command(config: Config) -> Result<(), anyhow::Error> {
    let json = DataSpec::builtin_cpu().to_json_string_pretty()?;

    match config.output {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("failed to write spec to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
