//! Configuration loading for kola.
//!
//! Configuration is loaded from a TOML file given with `--config`. Every
//! field has a default, so a missing file or section is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kola_platform::discovery::DEFAULT_DISCOVERY_BASE;
use kola_platform::{GceOptions, QemuOptions};
use serde::Deserialize;

use crate::runner::Timeouts;

/// Root configuration for kola.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Platforms a test without a whitelist runs on (default: qemu, gce).
    #[serde(default = "default_platforms")]
    pub default_platforms: Vec<String>,
    /// Local `kolet` binary to deploy (default: next to `kola`, then `$PATH`).
    #[serde(default)]
    pub kolet_path: Option<PathBuf>,
    /// QEMU backend configuration.
    #[serde(default)]
    pub qemu: QemuConfig,
    /// GCE backend configuration.
    #[serde(default)]
    pub gce: GceConfig,
    /// Discovery service configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Stage time limits.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// QEMU backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QemuConfig {
    /// Disk image machines boot from.
    #[serde(default = "default_qemu_image")]
    pub image: PathBuf,
    /// QEMU binary (default: qemu-system-x86_64).
    #[serde(default = "default_qemu_binary")]
    pub binary: String,
    /// Memory per machine in MiB (default: 1024).
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    /// Cluster bridge (default: br0).
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// SSH login user (default: core).
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

/// GCE backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GceConfig {
    /// GCP project.
    #[serde(default)]
    pub project: String,
    /// Zone (default: us-central1-a).
    #[serde(default = "default_zone")]
    pub zone: String,
    /// Machine type (default: n1-standard-1).
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    /// Boot image.
    #[serde(default)]
    pub image: String,
    /// Project owning the boot image.
    #[serde(default)]
    pub image_project: String,
    /// SSH login user (default: core).
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

/// Discovery service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL (default: https://discovery.etcd.io).
    #[serde(default = "default_discovery_base")]
    pub base_url: String,
}

/// Stage time limits, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Discovery allocation and machine start, each (default: 300).
    #[serde(default = "default_provision_secs")]
    pub provision_secs: u64,
    /// One remote command (default: 60).
    #[serde(default = "default_ssh_secs")]
    pub ssh_secs: u64,
    /// Copying `kolet` to one machine (default: 120).
    #[serde(default = "default_deploy_secs")]
    pub deploy_secs: u64,
}

// Default value functions
fn default_platforms() -> Vec<String> {
    vec!["qemu".to_string(), "gce".to_string()]
}

fn default_qemu_image() -> PathBuf {
    PathBuf::from("coreos_production_qemu_image.img")
}

fn default_qemu_binary() -> String {
    "qemu-system-x86_64".to_string()
}

fn default_memory_mb() -> u32 {
    1024
}

fn default_bridge() -> String {
    "br0".to_string()
}

fn default_ssh_user() -> String {
    "core".to_string()
}

fn default_zone() -> String {
    "us-central1-a".to_string()
}

fn default_machine_type() -> String {
    "n1-standard-1".to_string()
}

fn default_discovery_base() -> String {
    DEFAULT_DISCOVERY_BASE.to_string()
}

fn default_provision_secs() -> u64 {
    300
}

fn default_ssh_secs() -> u64 {
    60
}

fn default_deploy_secs() -> u64 {
    120
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            image: default_qemu_image(),
            binary: default_qemu_binary(),
            memory_mb: default_memory_mb(),
            bridge: default_bridge(),
            ssh_user: default_ssh_user(),
        }
    }
}

impl Default for GceConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: default_zone(),
            machine_type: default_machine_type(),
            image: String::new(),
            image_project: String::new(),
            ssh_user: default_ssh_user(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_url: default_discovery_base(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            provision_secs: default_provision_secs(),
            ssh_secs: default_ssh_secs(),
            deploy_secs: default_deploy_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_platforms: default_platforms(),
            kolet_path: None,
            qemu: QemuConfig::default(),
            gce: GceConfig::default(),
            discovery: DiscoveryConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Options for the QEMU backend.
    pub fn qemu_options(&self) -> QemuOptions {
        QemuOptions {
            image: self.qemu.image.clone(),
            qemu_binary: self.qemu.binary.clone(),
            memory_mb: self.qemu.memory_mb,
            bridge: self.qemu.bridge.clone(),
            ssh_user: self.qemu.ssh_user.clone(),
            discovery_base: self.discovery.base_url.clone(),
            ssh_timeout: Duration::from_secs(self.timeouts.ssh_secs),
            boot_timeout: self.step_limit(),
        }
    }

    /// Options for the GCE backend.
    pub fn gce_options(&self) -> GceOptions {
        GceOptions {
            project: self.gce.project.clone(),
            zone: self.gce.zone.clone(),
            machine_type: self.gce.machine_type.clone(),
            image: self.gce.image.clone(),
            image_project: self.gce.image_project.clone(),
            ssh_user: self.gce.ssh_user.clone(),
            discovery_base: self.discovery.base_url.clone(),
            ssh_timeout: Duration::from_secs(self.timeouts.ssh_secs),
            provision_timeout: self.step_limit(),
            ..GceOptions::default()
        }
    }

    /// Limit for a backend step inside a provisioning stage. Shorter than
    /// the stage, so the step's own timeout is the one reported.
    fn step_limit(&self) -> Duration {
        let stage = Duration::from_secs(self.timeouts.provision_secs);
        stage - stage / 10
    }

    /// Runner stage limits.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            provision: Duration::from_secs(self.timeouts.provision_secs),
            deploy: Duration::from_secs(self.timeouts.deploy_secs),
        }
    }

    /// Local `kolet` binary to deploy.
    ///
    /// Uses `kolet_path` when set, then a `kolet` next to the running
    /// executable, then `kolet` on `$PATH`, and finally `./kolet`.
    pub fn resolve_kolet(&self) -> PathBuf {
        if let Some(path) = &self.kolet_path {
            return path.clone();
        }

        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("kolet")))
            .filter(|path| path.is_file());
        if let Some(path) = sibling {
            return path;
        }

        match which::which("kolet") {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!("kolet not on PATH ({}), using ./kolet", e);
                PathBuf::from("./kolet")
            }
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}
