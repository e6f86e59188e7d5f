//! Local cluster: an isolated network namespace with the services virtual
//! machines need.
//!
//! A [`LocalCluster`] owns three resources, created in this order and
//! released in reverse:
//!
//! 1. a network [`Namespace`](netns::Namespace)
//! 2. an [`SshAgent`](ssh_agent::SshAgent) commands authenticate through
//! 3. a [`Dnsmasq`](dnsmasq::Dnsmasq) serving DHCP/DNS on the cluster bridge,
//!    started from inside the namespace
//!
//! If any step fails the ones before it are released before the error is
//! returned, so a caller never sees a half-built cluster.

pub mod dnsmasq;
pub mod link;
pub mod netns;
pub mod ssh_agent;

use std::ffi::OsStr;
use std::io;
use std::process::{Child, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PlatformError, Result};
use crate::ssh::Launcher;
use crate::teardown::FirstError;
use dnsmasq::{Dnsmasq, DnsmasqConfig};
use link::TunTap;
use netns::Namespace;
use ssh_agent::SshAgent;

/// Environment variable pointing SSH clients at the cluster's agent.
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// A resource owned by a local cluster.
#[async_trait]
pub trait Service: Send + Sync {
    /// Release the resource. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl Service for Namespace {
    async fn close(&self) -> Result<()> {
        Namespace::close(self).await.map_err(Into::into)
    }
}

#[async_trait]
impl<T: Service + ?Sized> Service for Arc<T> {
    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Creates the pieces a [`LocalCluster`] is assembled from.
#[async_trait]
pub trait LocalStack: Send + Sync {
    /// Namespace handle.
    type Namespace: Service;
    /// SSH agent.
    type Agent: Service;
    /// DHCP/DNS helper.
    type Dhcp: Service;

    /// Allocate the namespace.
    async fn create_namespace(&self) -> Result<Self::Namespace>;

    /// Start the SSH agent for `ns`.
    async fn start_agent(&self, ns: &Self::Namespace) -> Result<Self::Agent>;

    /// Start the DHCP/DNS helper. It must be launched from inside `ns`.
    async fn start_dhcp(&self, ns: &Self::Namespace) -> Result<Self::Dhcp>;
}

/// The real stack: kernel namespace, `ssh-agent` and `dnsmasq`.
#[derive(Debug, Clone, Default)]
pub struct HostStack {
    /// Bridge and DHCP settings.
    pub dnsmasq: DnsmasqConfig,
}

#[async_trait]
impl LocalStack for HostStack {
    type Namespace = Arc<Namespace>;
    type Agent = SshAgent;
    type Dhcp = Dnsmasq;

    async fn create_namespace(&self) -> Result<Arc<Namespace>> {
        Ok(Arc::new(Namespace::create().await?))
    }

    async fn start_agent(&self, ns: &Arc<Namespace>) -> Result<SshAgent> {
        SshAgent::new(ns).await
    }

    async fn start_dhcp(&self, ns: &Arc<Namespace>) -> Result<Dnsmasq> {
        Dnsmasq::start(ns, self.dnsmasq.clone()).await
    }
}

/// A namespace plus the SSH agent and DHCP/DNS helper living in it.
pub struct LocalCluster<S: LocalStack = HostStack> {
    ns: S::Namespace,
    agent: S::Agent,
    dhcp: S::Dhcp,
    taps: AtomicUsize,
}

impl<S: LocalStack> LocalCluster<S> {
    /// Assemble a cluster from `stack`, rolling back on failure.
    pub async fn with_stack(stack: &S) -> Result<Self> {
        let ns = stack.create_namespace().await?;

        let agent = match stack.start_agent(&ns).await {
            Ok(agent) => agent,
            Err(e) => {
                release_partial(&[("namespace", &ns as &dyn Service)]).await;
                return Err(e);
            }
        };

        let dhcp = match stack.start_dhcp(&ns).await {
            Ok(dhcp) => dhcp,
            Err(e) => {
                release_partial(&[
                    ("ssh agent", &agent as &dyn Service),
                    ("namespace", &ns as &dyn Service),
                ])
                .await;
                return Err(e);
            }
        };

        tracing::info!("local cluster ready");
        Ok(Self {
            ns,
            agent,
            dhcp,
            taps: AtomicUsize::new(0),
        })
    }

    /// Release the helper, the agent and the namespace, in that order.
    ///
    /// Every release runs; the first failure is returned.
    pub async fn destroy(&self) -> Result<()> {
        let mut errs = FirstError::new();
        errs.record("dnsmasq", self.dhcp.close().await);
        errs.record("ssh agent", self.agent.close().await);
        errs.record("namespace", self.ns.close().await);
        errs.finish()
    }

    /// The SSH agent.
    pub fn agent(&self) -> &S::Agent {
        &self.agent
    }

    fn next_tap_name(&self) -> String {
        format!("tap{}", self.taps.fetch_add(1, Ordering::Relaxed))
    }
}

/// Close already-created resources after a failed construction step.
async fn release_partial(resources: &[(&str, &dyn Service)]) {
    for (what, resource) in resources {
        if let Err(e) = resource.close().await {
            tracing::warn!("rolling back {}: {}", what, e);
        }
    }
}

impl LocalCluster<HostStack> {
    /// Build a cluster on the host with the given bridge and DHCP settings.
    pub async fn new(dnsmasq: DnsmasqConfig) -> Result<Self> {
        Self::with_stack(&HostStack { dnsmasq }).await
    }

    /// A command that runs inside the namespace with `SSH_AUTH_SOCK` set.
    pub fn new_command<I, A>(&self, program: &str, args: I) -> NsCommand
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let mut cmd = std::process::Command::new(program);
        cmd.args(args).env(SSH_AUTH_SOCK, self.agent.socket());
        NsCommand {
            ns: Arc::clone(&self.ns),
            cmd,
        }
    }

    /// Launcher that starts processes inside the namespace.
    pub fn launcher(&self) -> Arc<dyn Launcher> {
        self.ns.clone()
    }

    /// Create a tap device, bring it up and attach it to `bridge`.
    ///
    /// Each step's failure carries its own stage: `"tap failed"`,
    /// `"tap up failed"`, `"bridge failed"` or `"set master failed"`.
    pub async fn new_tap(&self, bridge: &str) -> Result<TunTap> {
        let name = self.next_tap_name();
        let bridge = bridge.to_string();

        self.ns
            .run(move || -> Result<TunTap> {
                let tap = link::add_tap(&name).map_err(|e| PlatformError::link("tap failed", e))?;
                link::set_up(&tap.name).map_err(|e| PlatformError::link("tap up failed", e))?;
                let br = link::bridge_by_name(&bridge)
                    .map_err(|e| PlatformError::link("bridge failed", e))?;
                link::set_master(&tap, &br)
                    .map_err(|e| PlatformError::link("set master failed", e))?;
                Ok(tap)
            })
            .await?
    }

    /// Delete a tap created by [`LocalCluster::new_tap`].
    pub async fn delete_tap(&self, tap: &TunTap) -> Result<()> {
        let name = tap.name.clone();
        self.ns
            .run(move || link::delete(&name))
            .await?
            .map_err(|e| PlatformError::link("tap delete failed", e))
    }
}

/// A command bound to a cluster namespace.
pub struct NsCommand {
    ns: Arc<Namespace>,
    cmd: std::process::Command,
}

impl NsCommand {
    /// Start the process inside the namespace.
    pub async fn spawn(self) -> Result<Child> {
        let mut cmd = self.cmd;
        Ok(self.ns.run(move || cmd.spawn()).await??)
    }

    /// Run the process inside the namespace and wait for it.
    pub async fn output(self) -> Result<Output> {
        Ok(self.ns.output(self.cmd, None).await?)
    }
}

/// Kill a child process if it is still running and reap it.
pub(crate) async fn terminate(mut child: Child) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        child.wait().map(drop)
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every open/close; can be told to fail one step.
    #[derive(Default)]
    struct FakeStack {
        log: Arc<Mutex<Vec<String>>>,
        fail_agent: bool,
        fail_dhcp: bool,
        fail_close: Option<&'static str>,
    }

    struct FakeService {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_close: bool,
    }

    #[async_trait]
    impl Service for FakeService {
        async fn close(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("close {}", self.name));
            if self.fail_close {
                return Err(PlatformError::Dnsmasq(format!("{} close failed", self.name)));
            }
            Ok(())
        }
    }

    impl FakeStack {
        fn service(&self, name: &'static str) -> FakeService {
            self.log.lock().unwrap().push(format!("open {}", name));
            FakeService {
                name,
                log: self.log.clone(),
                fail_close: self.fail_close == Some(name),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocalStack for FakeStack {
        type Namespace = FakeService;
        type Agent = FakeService;
        type Dhcp = FakeService;

        async fn create_namespace(&self) -> Result<FakeService> {
            Ok(self.service("ns"))
        }

        async fn start_agent(&self, _ns: &FakeService) -> Result<FakeService> {
            if self.fail_agent {
                return Err(PlatformError::SshAgent("agent refused".into()));
            }
            Ok(self.service("agent"))
        }

        async fn start_dhcp(&self, _ns: &FakeService) -> Result<FakeService> {
            if self.fail_dhcp {
                return Err(PlatformError::Dnsmasq("dnsmasq refused".into()));
            }
            Ok(self.service("dhcp"))
        }
    }

    #[tokio::test]
    async fn construction_order_and_destroy_order() {
        let stack = FakeStack::default();
        let cluster = LocalCluster::with_stack(&stack).await.unwrap();
        cluster.destroy().await.unwrap();

        assert_eq!(
            stack.log(),
            vec![
                "open ns",
                "open agent",
                "open dhcp",
                "close dhcp",
                "close agent",
                "close ns"
            ]
        );
    }

    #[tokio::test]
    async fn dhcp_failure_releases_agent_then_namespace() {
        let stack = FakeStack {
            fail_dhcp: true,
            ..Default::default()
        };
        let err = LocalCluster::with_stack(&stack).await.err().unwrap();

        assert!(matches!(err, PlatformError::Dnsmasq(_)));
        assert_eq!(
            stack.log(),
            vec!["open ns", "open agent", "close agent", "close ns"]
        );
    }

    #[tokio::test]
    async fn agent_failure_releases_namespace() {
        let stack = FakeStack {
            fail_agent: true,
            ..Default::default()
        };
        let err = LocalCluster::with_stack(&stack).await.err().unwrap();

        assert!(matches!(err, PlatformError::SshAgent(_)));
        assert_eq!(stack.log(), vec!["open ns", "close ns"]);
    }

    #[tokio::test]
    async fn destroy_runs_everything_and_returns_first_error() {
        let stack = FakeStack {
            fail_close: Some("agent"),
            ..Default::default()
        };
        let cluster = LocalCluster::with_stack(&stack).await.unwrap();
        let err = cluster.destroy().await.unwrap_err();

        assert_eq!(err.to_string(), "dnsmasq failed: agent close failed");
        assert_eq!(
            &stack.log()[3..],
            &["close dhcp", "close agent", "close ns"]
        );
    }

    #[tokio::test]
    async fn tap_names_are_unique_per_cluster() {
        let stack = FakeStack::default();
        let cluster = LocalCluster::with_stack(&stack).await.unwrap();
        assert_eq!(cluster.next_tap_name(), "tap0");
        assert_eq!(cluster.next_tap_name(), "tap1");
    }

    #[tokio::test]
    #[ignore = "requires root, ssh-agent and dnsmasq"]
    async fn host_cluster_creates_tap_on_bridge() {
        let cluster = LocalCluster::new(DnsmasqConfig::default()).await.unwrap();
        let tap = cluster.new_tap("br0").await.unwrap();
        assert_eq!(tap.name, "tap0");

        let missing = cluster.new_tap("nope0").await.unwrap_err();
        assert!(missing.to_string().starts_with("bridge failed"));

        let out = cluster
            .new_command("sh", ["-c", "echo $SSH_AUTH_SOCK"])
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).contains("agent.sock"));

        cluster.destroy().await.unwrap();
    }
}
