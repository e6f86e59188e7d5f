//! Cluster and machine contracts shared by every backend.
//!
//! A [`Cluster`] owns a set of running [`Machine`]s plus whatever backend
//! resources they need (a network namespace and helper processes for the
//! local backend, cloud instances for GCE). Destroying the cluster releases
//! all of it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Remote path the native helper binary is installed at on every machine.
pub const KOLET_REMOTE_PATH: &str = "./kolet";

/// A single command execution over SSH.
///
/// Sessions are one-shot: configure stdin, then run one command.
#[async_trait]
pub trait SshSession: Send {
    /// Feed `input` to the remote command's standard input.
    fn set_stdin(&mut self, input: Vec<u8>);

    /// Run `cmd` on the remote machine and return its stdout followed by its stderr.
    ///
    /// A non-zero exit status is an error.
    async fn combined_output(self: Box<Self>, cmd: &str) -> Result<Vec<u8>>;
}

/// A running instance reachable over SSH.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Backend-specific identifier.
    fn id(&self) -> &str;

    /// Address SSH connects to.
    fn ip(&self) -> &str;

    /// Open a new SSH session to this machine.
    async fn ssh_session(&self) -> Result<Box<dyn SshSession>>;

    /// Run `cmd` over a fresh session and return its combined output.
    async fn ssh(&self, cmd: &str) -> Result<Vec<u8>> {
        self.ssh_session().await?.combined_output(cmd).await
    }

    /// Release the machine.
    async fn destroy(&self) -> Result<()>;
}

/// A group of machines plus a discovery endpoint.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Start a machine booted with `config`.
    async fn new_machine(&self, config: &str) -> Result<Arc<dyn Machine>>;

    /// Allocate a discovery endpoint for a cluster of `size` members.
    async fn get_discovery_url(&self, size: usize) -> Result<String>;

    /// Every machine started so far.
    async fn machines(&self) -> Vec<Arc<dyn Machine>>;

    /// Release every machine and backend resource.
    async fn destroy(&self) -> Result<()>;
}

/// The handle a test's run function receives: the test's name plus the live cluster.
#[derive(Clone)]
pub struct TestCluster {
    /// Name of the test being run.
    pub name: String,
    /// The cluster the test runs against.
    pub cluster: Arc<dyn Cluster>,
}

impl TestCluster {
    /// Wrap a live cluster for the test called `name`.
    pub fn new(name: impl Into<String>, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            name: name.into(),
            cluster,
        }
    }

    /// Every machine in the cluster.
    pub async fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.cluster.machines().await
    }

    /// Run one of this test's native functions on `machine` through the deployed helper.
    pub async fn run_native(&self, func: &str, machine: &dyn Machine) -> Result<Vec<u8>> {
        machine.ssh(&native_command(&self.name, func)).await
    }
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Command line that invokes `func` of test `test` through the native helper.
pub fn native_command(test: &str, func: &str) -> String {
    format!("{} run {} {}", KOLET_REMOTE_PATH, test, func)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_command_uses_remote_helper_path() {
        assert_eq!(
            native_command("coretest.NativeHello", "Hello"),
            "./kolet run coretest.NativeHello Hello"
        );
    }
}
