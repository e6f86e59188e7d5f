//! # kola
//!
//! Integration-test harness for distributed cluster software.
//!
//! Tests are registered in a [`Registry`]. The [`Runner`] selects them by
//! glob, provisions a fresh cluster per test and platform, templates each
//! machine's config, drops the `kolet` helper on the machines when a test
//! has native functions, runs the test and always destroys the cluster.
//!
//! ## Modules
//!
//! - [`registry`]: test definitions and glob selection
//! - [`template`]: `$discovery` / `$name` config templating
//! - [`runner`]: per-platform cluster runs and the overall pass/fail result
//! - [`deploy`]: copying files to machines over SSH
//! - [`config`]: TOML configuration
//! - [`suite`]: the built-in tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod deploy;
pub mod error;
pub mod registry;
pub mod runner;
pub mod suite;
pub mod template;

pub use config::{Config, ConfigError};
pub use error::{KolaError, RegistryError, Result};
pub use registry::{NativeFn, Registry, RunFn, Test};
pub use runner::{ClusterFactory, PlatformFactory, RunOutcome, Runner, Timeouts};
