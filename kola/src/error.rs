//! Error types for kola.

use kola_platform::PlatformError;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A test with this name is already registered.
    #[error("test already registered with same name: {0}")]
    DuplicateName(String),
}

/// Errors from a test run.
///
/// The stage variants prefix the underlying platform error so a failure line
/// says which step of the cluster run broke.
#[derive(Debug, thiserror::Error)]
pub enum KolaError {
    /// No backend exists for this platform name.
    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    /// Cluster construction failed.
    #[error("cluster failed: {0}")]
    Cluster(#[source] PlatformError),

    /// Discovery endpoint allocation failed.
    #[error("failed to create discovery endpoint: {0}")]
    Discovery(#[source] PlatformError),

    /// A machine could not be started.
    #[error("cluster failed starting machine: {0}")]
    StartMachine(#[source] PlatformError),

    /// The native helper could not be installed on a machine.
    #[error("dropping kolet binary: {0}")]
    DeployKolet(#[source] PlatformError),

    /// The test's run function returned an error.
    #[error("{0:#}")]
    TestFailed(anyhow::Error),

    /// The test's run function panicked.
    #[error("test panicked: {0}")]
    TestPanicked(String),

    /// Selection pattern is not a valid glob.
    #[error("bad pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// Result type alias for kola operations.
pub type Result<T> = std::result::Result<T, KolaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_carry_their_prefix() {
        let err = KolaError::StartMachine(PlatformError::Timeout("ssh on qemu-0".into()));
        assert_eq!(
            err.to_string(),
            "cluster failed starting machine: timeout waiting for ssh on qemu-0"
        );

        let err = KolaError::Discovery(PlatformError::DiscoveryStatus { status: 500 });
        assert!(err
            .to_string()
            .starts_with("failed to create discovery endpoint: "));
    }

    #[test]
    fn test_failure_shows_context_chain() {
        let inner = anyhow::anyhow!("etcdctl exited 1").context("checking instance0");
        let err = KolaError::TestFailed(inner);
        assert_eq!(err.to_string(), "checking instance0: etcdctl exited 1");
    }

    #[test]
    fn duplicate_name_display() {
        let err = RegistryError::DuplicateName("etcd.Discovery".into());
        assert!(err.to_string().ends_with("etcd.Discovery"));
    }
}
