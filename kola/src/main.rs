//! # kola
//!
//! Runs the built-in integration tests against freshly provisioned clusters.
//!
//! ## Commands
//!
//! - `run [PATTERN]`: run every test whose name matches the glob (default `*`)
//! - `list`: show registered tests and the platforms they run on
//!
//! ## Example
//!
//! ```bash
//! # Run the etcd tests on the configured platforms
//! kola --config kola.toml run 'etcd.*'
//!
//! # Show what is available
//! kola list
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kola::{suite, Config, PlatformFactory, Runner};

/// Integration-test harness for cluster software.
#[derive(Parser, Debug)]
#[command(name = "kola")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run tests matching a glob pattern
    Run {
        /// Glob over test names; `*` does not match `/`
        pattern: Option<String>,
    },

    /// List registered tests
    List,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kola=info,kola_platform=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let registry = suite::registry().context("Failed to register tests")?;

    match cli.command {
        Commands::Run { pattern } => {
            let factory = PlatformFactory::new(config.qemu_options(), config.gce_options());
            let runner = Runner::new(registry, Arc::new(factory))
                .default_platforms(config.default_platforms.clone())
                .kolet_path(config.resolve_kolet())
                .timeouts(config.timeouts());

            let outcome = runner.run_tests(pattern.as_deref()).await;
            Ok(ExitCode::from(outcome.exit_code()))
        }
        Commands::List => {
            for test in registry.iter() {
                let platforms = test
                    .platforms
                    .as_ref()
                    .unwrap_or(&config.default_platforms)
                    .join(",");
                println!("{}\t{}", test.name, platforms);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
