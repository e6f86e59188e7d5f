//! Error types for kola-platform.

use crate::local::link::LinkError;
use crate::local::netns::NsError;
use crate::ssh::SshError;

/// Main error type for cluster provisioning and teardown.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Network namespace error.
    #[error("namespace error: {0}")]
    Namespace(#[from] NsError),

    /// SSH execution error.
    #[error("ssh error: {0}")]
    Ssh(#[from] SshError),

    /// A link-layer step failed.
    ///
    /// `stage` identifies the step, e.g. `"tap failed"` or `"set master failed"`.
    #[error("{stage}: {source}")]
    Link {
        /// Which step failed.
        stage: &'static str,
        /// Underlying `ip` failure.
        #[source]
        source: LinkError,
    },

    /// The SSH agent could not be started or stopped.
    #[error("ssh agent failed: {0}")]
    SshAgent(String),

    /// The DHCP/DNS helper could not be started or stopped.
    #[error("dnsmasq failed: {0}")]
    Dnsmasq(String),

    /// A QEMU machine could not be started.
    #[error("qemu failed: {0}")]
    Qemu(String),

    /// A `gcloud` invocation failed.
    #[error("gcloud failed: {0}")]
    Gce(String),

    /// Discovery request failed.
    #[error("discovery request failed: {0}")]
    Discovery(#[from] reqwest::Error),

    /// Discovery endpoint answered with a non-success status.
    #[error("discovery endpoint returned status {status}")]
    DiscoveryStatus {
        /// HTTP status code.
        status: u16,
    },

    /// A bounded operation did not finish in time.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Wrap a link-layer failure with the step that produced it.
    pub fn link(stage: &'static str, source: LinkError) -> Self {
        Self::Link { stage, source }
    }
}

/// Result type alias for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;
