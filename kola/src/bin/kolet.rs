//! # kolet
//!
//! Native test helper. `kola` copies it onto every machine of a test that
//! has native functions and invokes it as `./kolet run <test> <func>`.
//!
//! Exit status: 0 when the function succeeds, 1 when it fails, 2 on a usage
//! error (including an unknown test or function).

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kola::suite;

/// Runs a registered native function on this machine.
#[derive(Parser, Debug)]
#[command(name = "kolet")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one native function
    Run {
        /// Test name, e.g. coretest.NativeHello
        test: String,
        /// Native function name, e.g. Hello
        func: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = match suite::registry() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run { test, func } => {
            let Some(native) = registry.native_func(&test, &func) else {
                eprintln!("no native function {} in test {}", func, test);
                return ExitCode::from(2);
            };
            match native() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}.{} failed: {:#}", test, func, e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
