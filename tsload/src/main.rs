//! Entrypoint of the tsload binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use dotenvy::dotenv;

mod logging;
mod runtime;

mod commands {
    pub(crate) mod load;
    pub(crate) mod spec;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "tsload",
    version,
    about = "Write-load benchmark for managed time-series write APIs",
    long_about = r#"Write-load benchmark for managed time-series write APIs

Examples:
    # Replay a data file with 8 workers, one request per point
    tsload load --file data.txt --workers 8

    # Generate points from the builtin cpu spec, one record per value
    tsload spec > cpu.json
    tsload load --simulator-spec cpu.json --simulator-max-points 100000 --use-common-attributes false

    # Run with debug logging
    tsload load -vv --file data.txt
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: runtime::TokioRuntimeConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
#[allow(clippy::large_enum_variant)]
enum Command {
    /// Load points into the target
    Load(commands::load::Config),

    /// Print the builtin simulator data spec as JSON
    Spec(commands::spec::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Load(config)) => {
                if let Err(e) = logging::init(&config.logging_config) {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
                if let Err(e) = commands::load::command(config).await {
                    eprintln!("Load command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Spec(config)) => {
                if let Err(e) = commands::spec::command(config) {
                    eprintln!("Spec command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before parsing the config, so its variables act as
/// defaults for the `env` fallbacks of every flag.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing .env file is fine
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
