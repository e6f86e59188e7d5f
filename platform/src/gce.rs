//! Google Compute Engine backend, driven through the `gcloud` CLI.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::cluster::{Cluster, Machine, SshSession};
use crate::discovery::{DiscoveryClient, DEFAULT_DISCOVERY_BASE};
use crate::error::{PlatformError, Result};
use crate::ssh::{HostLauncher, Launcher, OpenSshSession, SshTarget};
use crate::teardown::FirstError;

/// Settings for the GCE backend.
#[derive(Debug, Clone)]
pub struct GceOptions {
    /// GCP project instances are created in.
    pub project: String,
    /// Zone instances are created in.
    pub zone: String,
    /// Instance machine type.
    pub machine_type: String,
    /// Boot image name.
    pub image: String,
    /// Project the boot image belongs to.
    pub image_project: String,
    /// User SSH logs in as.
    pub ssh_user: String,
    /// Discovery service base URL.
    pub discovery_base: String,
    /// Limit for one SSH command.
    pub ssh_timeout: Duration,
    /// Limit for one `gcloud` call.
    pub provision_timeout: Duration,
    /// `gcloud` binary.
    pub gcloud_binary: String,
}

impl Default for GceOptions {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: "us-central1-a".into(),
            machine_type: "n1-standard-1".into(),
            image: String::new(),
            image_project: String::new(),
            ssh_user: "core".into(),
            discovery_base: DEFAULT_DISCOVERY_BASE.into(),
            ssh_timeout: Duration::from_secs(60),
            provision_timeout: Duration::from_secs(300),
            gcloud_binary: "gcloud".into(),
        }
    }
}

impl GceOptions {
    /// Arguments creating instance `name` with `user_data` as its config.
    pub fn create_args(&self, name: &str, user_data: &Path) -> Vec<String> {
        vec![
            "compute".into(),
            "instances".into(),
            "create".into(),
            name.into(),
            format!("--project={}", self.project),
            format!("--zone={}", self.zone),
            format!("--machine-type={}", self.machine_type),
            format!("--image={}", self.image),
            format!("--image-project={}", self.image_project),
            format!("--metadata-from-file=user-data={}", user_data.display()),
            "--format=json".into(),
        ]
    }

    /// Arguments deleting instance `name`.
    pub fn delete_args(&self, name: &str) -> Vec<String> {
        vec![
            "compute".into(),
            "instances".into(),
            "delete".into(),
            name.into(),
            format!("--project={}", self.project),
            format!("--zone={}", self.zone),
            "--quiet".into(),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

/// Pull the first external address out of `gcloud ... create --format=json` output.
pub fn parse_nat_ip(json: &str) -> Result<String> {
    let instances: Vec<Instance> = serde_json::from_str(json)
        .map_err(|e| PlatformError::Gce(format!("unexpected gcloud output: {}", e)))?;
    instances
        .into_iter()
        .flat_map(|i| i.network_interfaces)
        .flat_map(|n| n.access_configs)
        .find_map(|a| a.nat_ip)
        .ok_or_else(|| PlatformError::Gce("instance has no external address".into()))
}

/// A cluster of GCE instances.
pub struct GceCluster {
    opts: GceOptions,
    prefix: String,
    discovery: DiscoveryClient,
    scratch: TempDir,
    instances: Mutex<Instances>,
}

#[derive(Default)]
struct Instances {
    /// Every name a create request went out for, up or not.
    requested: Vec<String>,
    up: Vec<Arc<GceMachine>>,
}

impl GceCluster {
    /// New, empty cluster. Instance names share a random prefix.
    pub fn new(opts: GceOptions) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("kola-gce-").tempdir()?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let prefix = format!("kola-{}", &id[..8]);
        tracing::debug!("gce cluster {} in {}/{}", prefix, opts.project, opts.zone);

        Ok(Self {
            discovery: DiscoveryClient::new(opts.discovery_base.clone()),
            opts,
            prefix,
            scratch,
            instances: Mutex::new(Instances::default()),
        })
    }

    /// Prefix every instance name in this cluster starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Run `gcloud` with `args` under `limit`, returning stdout.
async fn gcloud(opts: &GceOptions, args: Vec<String>) -> Result<String> {
    let mut cmd = Command::new(&opts.gcloud_binary);
    cmd.args(&args);
    let output = tokio::time::timeout(opts.provision_timeout, HostLauncher.output(cmd, None))
        .await
        .map_err(|_| PlatformError::Timeout(format!("gcloud {}", args.join(" "))))??;

    if !output.status.success() {
        return Err(PlatformError::Gce(format!(
            "`gcloud {}` exited with {}: {}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Delete instance `name`. One that does not exist counts as deleted.
async fn delete_instance(opts: &GceOptions, name: &str) -> Result<()> {
    match gcloud(opts, opts.delete_args(name)).await {
        Ok(_) => Ok(()),
        Err(PlatformError::Gce(msg)) if msg.contains("was not found") => {
            tracing::debug!("{} was never created", name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Cluster for GceCluster {
    async fn new_machine(&self, config: &str) -> Result<Arc<dyn Machine>> {
        let mut instances = self.instances.lock().await;
        let name = format!("{}-{}", self.prefix, instances.requested.len());

        let user_data = self.scratch.path().join(format!("{}.conf", name));
        tokio::fs::write(&user_data, config).await?;

        // Recorded before the request: an abandoned call may still create it.
        instances.requested.push(name.clone());
        let json = gcloud(&self.opts, self.opts.create_args(&name, &user_data)).await?;
        let machine = Arc::new(GceMachine {
            ip: parse_nat_ip(&json)?,
            name,
            opts: self.opts.clone(),
        });
        instances.up.push(Arc::clone(&machine));

        tracing::info!("{} up at {}", machine.name, machine.ip);
        Ok(machine)
    }

    async fn get_discovery_url(&self, size: usize) -> Result<String> {
        self.discovery.new_url(size).await
    }

    async fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.instances
            .lock()
            .await
            .up
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn Machine>)
            .collect()
    }

    async fn destroy(&self) -> Result<()> {
        let requested = {
            let mut instances = self.instances.lock().await;
            instances.up.clear();
            std::mem::take(&mut instances.requested)
        };
        let mut errs = FirstError::new();
        for name in requested {
            errs.record(&name, delete_instance(&self.opts, &name).await);
        }
        errs.finish()
    }
}

/// A GCE instance.
#[derive(Debug)]
pub struct GceMachine {
    name: String,
    ip: String,
    opts: GceOptions,
}

#[async_trait]
impl Machine for GceMachine {
    fn id(&self) -> &str {
        &self.name
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    async fn ssh_session(&self) -> Result<Box<dyn SshSession>> {
        Ok(Box::new(OpenSshSession::new(
            SshTarget::new(&self.opts.ssh_user, &self.ip),
            Arc::new(HostLauncher),
            self.opts.ssh_timeout,
        )))
    }

    async fn destroy(&self) -> Result<()> {
        delete_instance(&self.opts, &self.name).await
    }
}
