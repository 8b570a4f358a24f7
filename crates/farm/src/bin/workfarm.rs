//! workfarm: run calls against a worker executable from the command line.
//!
//! # Usage
//!
//! ```bash
//! # One call, arguments parsed as JSON (bare words become strings)
//! workfarm call --worker target/debug/workfarm-demo-worker add 2 40
//!
//! # The same call 16 times across 4 workers
//! workfarm call --worker ./my-worker --workers 4 --repeat 16 transform src/lib.rs
//!
//! # Validate a config file and print the resolved settings
//! workfarm config workfarm.toml
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::Value;

use workfarm::{BackendKind, FarmBuilder, FarmConfig};

#[derive(Parser, Debug)]
#[command(name = "workfarm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a farm, run a method and print each result as a JSON line.
    Call {
        /// Worker executable serving the module.
        #[arg(long, env = "WORKFARM_WORKER")]
        worker: PathBuf,

        /// Optional farm config; the called method must be exported by it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pool size (default: from config, else available parallelism - 1).
        #[arg(long)]
        workers: Option<usize>,

        /// Submit the call this many times concurrently.
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Grace period for shutdown in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Treat the method as returning a lazy sequence.
        #[arg(long)]
        sequence: bool,

        /// Do not mirror worker output to this terminal.
        #[arg(long)]
        quiet: bool,

        method: String,

        /// Arguments, parsed as JSON where possible.
        args: Vec<String>,
    },

    /// Validate a config file and print it as resolved.
    Config { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Call {
            worker,
            config,
            workers,
            repeat,
            timeout_ms,
            sequence,
            quiet,
            method,
            args,
        } => {
            let mut config = match config {
                Some(path) => FarmConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => {
                    let mut config = FarmConfig::new([method.clone()]);
                    config.apply_env_overrides();
                    config
                }
            };
            if let Some(n) = workers {
                config.num_workers = n;
            }
            if sequence && !config.sequence_methods.contains(&method) {
                config.sequence_methods.push(method.clone());
            }
            config.silent = quiet;
            if config.backend != BackendKind::Process {
                anyhow::bail!("the CLI only runs process farms, config asks for {}", config.backend);
            }

            let worker = worker.to_string_lossy().into_owned();
            let farm = FarmBuilder::new(worker).config(config).build()?;
            let args: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();

            let started = Instant::now();
            let handles = (0..repeat.max(1)).map(|_| farm.call(&method, args.clone()));
            let results = join_all(handles).await;

            let mut failures = 0;
            for result in results {
                match result {
                    Ok(value) => println!("{value}"),
                    Err(e) => {
                        failures += 1;
                        eprintln!("error: {e}");
                        if let Some(remote) = e.remote() {
                            if let Some(stack) = &remote.stack {
                                eprintln!("{stack}");
                            }
                        }
                    }
                }
            }
            tracing::info!(elapsed = ?started.elapsed(), calls = repeat.max(1), failures, "calls finished");

            let outcome = farm.end(timeout_ms.map(Duration::from_millis)).await?;
            if outcome.force_exited {
                tracing::warn!("workers had to be force-exited");
            }
            if failures > 0 {
                anyhow::bail!("{failures} call(s) failed");
            }
        }
        Command::Config { path } => {
            let config = FarmConfig::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
