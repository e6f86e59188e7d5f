//! Test runner.
//!
//! For every selected test and each of its platforms the runner builds a
//! fresh cluster, starts the machines, drops `kolet` on them when needed,
//! runs the test and destroys the cluster. The first failure ends the run.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use kola_platform::{
    Cluster, GceCluster, GceOptions, PlatformError, QemuCluster, QemuOptions, TestCluster,
    KOLET_REMOTE_PATH,
};

use crate::deploy;
use crate::error::{KolaError, Result};
use crate::registry::{Registry, Test};
use crate::template::make_configs;

/// Builds a cluster for a platform name.
#[async_trait]
pub trait ClusterFactory: Send + Sync {
    /// A fresh, empty cluster on `platform`.
    async fn create(&self, platform: &str) -> Result<Arc<dyn Cluster>>;
}

/// The real backends: `qemu` and `gce`.
#[derive(Debug, Clone)]
pub struct PlatformFactory {
    qemu: QemuOptions,
    gce: GceOptions,
}

impl PlatformFactory {
    /// Factory building clusters with these backend options.
    pub fn new(qemu: QemuOptions, gce: GceOptions) -> Self {
        Self { qemu, gce }
    }
}

#[async_trait]
impl ClusterFactory for PlatformFactory {
    async fn create(&self, platform: &str) -> Result<Arc<dyn Cluster>> {
        match platform {
            "qemu" => {
                let cluster = QemuCluster::new(self.qemu.clone())
                    .await
                    .map_err(KolaError::Cluster)?;
                Ok(Arc::new(cluster))
            }
            "gce" => {
                let cluster = GceCluster::new(self.gce.clone()).map_err(KolaError::Cluster)?;
                Ok(Arc::new(cluster))
            }
            other => Err(KolaError::InvalidPlatform(other.to_string())),
        }
    }
}

/// Per-stage time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Discovery allocation and each machine start.
    pub provision: Duration,
    /// Copying `kolet` to one machine.
    pub deploy: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            provision: Duration::from_secs(300),
            deploy: Duration::from_secs(120),
        }
    }
}

/// Result of a whole run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every selected test passed on every platform.
    Passed {
        /// Number of (test, platform) runs.
        ran: usize,
    },
    /// A test failed; nothing after it ran.
    Failed {
        /// Failing test.
        test: String,
        /// Platform it failed on.
        platform: String,
        /// What went wrong.
        error: KolaError,
    },
}

impl RunOutcome {
    /// Process exit status: 0 on success, 1 on failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Passed { .. } => 0,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

/// Runs registered tests against clusters from a [`ClusterFactory`].
pub struct Runner {
    registry: Registry,
    factory: Arc<dyn ClusterFactory>,
    default_platforms: Vec<String>,
    kolet: PathBuf,
    timeouts: Timeouts,
}

impl Runner {
    /// Runner over `registry` with `qemu` and `gce` as default platforms.
    pub fn new(registry: Registry, factory: Arc<dyn ClusterFactory>) -> Self {
        Self {
            registry,
            factory,
            default_platforms: vec!["qemu".to_string(), "gce".to_string()],
            kolet: PathBuf::from("./kolet"),
            timeouts: Timeouts::default(),
        }
    }

    /// Platforms for tests that do not name their own.
    pub fn default_platforms(mut self, platforms: Vec<String>) -> Self {
        self.default_platforms = platforms;
        self
    }

    /// Local `kolet` binary to deploy.
    pub fn kolet_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kolet = path.into();
        self
    }

    /// Stage time limits.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The tests this runner chooses from.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run every test matching `pattern` (default `*`) on each of its platforms.
    ///
    /// A malformed pattern is reported and matches nothing.
    pub async fn run_tests(&self, pattern: Option<&str>) -> RunOutcome {
        let pattern = pattern.unwrap_or("*");
        let tests = match self.registry.select(pattern) {
            Ok(tests) => tests,
            Err(e) => {
                eprintln!("{}", KolaError::Pattern(e));
                Vec::new()
            }
        };

        let mut ran = 0;
        for test in tests {
            let platforms = test.platforms.as_ref().unwrap_or(&self.default_platforms);
            for platform in platforms {
                if let Err(error) = self.run_test(test, platform).await {
                    eprintln!("{} failed on {}: {}", test.name, platform, error);
                    return RunOutcome::Failed {
                        test: test.name.clone(),
                        platform: platform.clone(),
                        error,
                    };
                }
                println!("test {} ran successfully on {}", test.name, platform);
                ran += 1;
            }
        }

        eprintln!("All {} test(s) ran successfully!", ran);
        RunOutcome::Passed { ran }
    }

    /// One cluster run: build, provision, run, and always destroy.
    pub async fn run_test(&self, test: &Test, platform: &str) -> Result<()> {
        let cluster = self.factory.create(platform).await?;
        tracing::debug!("running {} on {}", test.name, platform);

        let result = AssertUnwindSafe(self.exercise(test, platform, Arc::clone(&cluster)))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(KolaError::TestPanicked(panic_message(&*panic))));

        if let Err(e) = cluster.destroy().await {
            tracing::warn!("destroying {} cluster: {}", platform, e);
        }
        result
    }

    async fn exercise(&self, test: &Test, platform: &str, cluster: Arc<dyn Cluster>) -> Result<()> {
        let url = bounded(
            self.timeouts.provision,
            "discovery endpoint",
            cluster.get_discovery_url(test.cluster_size),
        )
        .await
        .map_err(KolaError::Discovery)?;

        for config in make_configs(&url, &test.cloud_config, test.cluster_size) {
            bounded(self.timeouts.provision, "machine start", cluster.new_machine(&config))
                .await
                .map_err(KolaError::StartMachine)?;
            tracing::info!("{} instance up", platform);
        }

        if test.has_native_funcs() {
            for machine in cluster.machines().await {
                bounded(
                    self.timeouts.deploy,
                    "kolet copy",
                    deploy::scp_file(machine.as_ref(), &self.kolet, KOLET_REMOTE_PATH),
                )
                .await
                .map_err(KolaError::DeployKolet)?;
            }
        }

        (test.run)(TestCluster::new(test.name.clone(), cluster))
            .await
            .map_err(KolaError::TestFailed)
    }
}

/// Await `fut`, turning an elapsed `limit` into a timeout naming `what`.
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> kola_platform::Result<T>
where
    F: Future<Output = kola_platform::Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PlatformError::Timeout(format!("{} ({:?})", what, limit)))?
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
