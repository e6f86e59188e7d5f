//! QEMU backend: virtual machines inside a [`LocalCluster`].
//!
//! Each machine gets a tap on the cluster bridge, a reserved MAC/IP pair
//! and its config through QEMU's firmware config interface. QEMU itself is
//! started inside the cluster namespace, so the VMs are only reachable from
//! there.

use std::path::PathBuf;
use std::process::Child;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::cluster::{Cluster, Machine, SshSession};
use crate::discovery::{DiscoveryClient, DEFAULT_DISCOVERY_BASE};
use crate::error::{PlatformError, Result};
use crate::local::dnsmasq::DnsmasqConfig;
use crate::local::link::TunTap;
use crate::local::{terminate, LocalCluster, SSH_AUTH_SOCK};
use crate::ssh::{Launcher, OpenSshSession, SshTarget};
use crate::teardown::FirstError;

/// Firmware config key the config document is passed under.
const FW_CFG_NAME: &str = "opt/com.coreos/config";

/// Settings for the QEMU backend.
#[derive(Debug, Clone)]
pub struct QemuOptions {
    /// Disk image every machine boots from, in snapshot mode.
    pub image: PathBuf,
    /// QEMU system emulator binary.
    pub qemu_binary: String,
    /// Memory per machine.
    pub memory_mb: u32,
    /// Cluster bridge name.
    pub bridge: String,
    /// User SSH logs in as.
    pub ssh_user: String,
    /// Discovery service base URL.
    pub discovery_base: String,
    /// Limit for one SSH command.
    pub ssh_timeout: Duration,
    /// How long a machine may take to answer SSH after QEMU starts.
    pub boot_timeout: Duration,
}

impl Default for QemuOptions {
    fn default() -> Self {
        Self {
            image: PathBuf::from("coreos_production_qemu_image.img"),
            qemu_binary: "qemu-system-x86_64".into(),
            memory_mb: 1024,
            bridge: "br0".into(),
            ssh_user: "core".into(),
            discovery_base: DEFAULT_DISCOVERY_BASE.into(),
            ssh_timeout: Duration::from_secs(60),
            boot_timeout: Duration::from_secs(180),
        }
    }
}

impl QemuOptions {
    /// Build the QEMU arguments for one machine.
    pub fn qemu_args(&self, tap: &str, mac: &str, config: &str) -> Vec<String> {
        vec![
            "-machine".into(),
            "accel=kvm".into(),
            "-cpu".into(),
            "host".into(),
            "-m".into(),
            self.memory_mb.to_string(),
            "-display".into(),
            "none".into(),
            "-drive".into(),
            format!("if=virtio,file={},snapshot=on", self.image.display()),
            "-netdev".into(),
            format!("tap,id=tap,ifname={},script=no,downscript=no", tap),
            "-device".into(),
            format!("virtio-net-pci,netdev=tap,mac={}", mac),
            "-fw_cfg".into(),
            format!("name={},file={}", FW_CFG_NAME, config),
        ]
    }
}

/// Add `key` to a cloud-config document's authorized keys.
///
/// An existing top-level `ssh_authorized_keys` list gets the key as its
/// first entry; otherwise the list is added right after the header.
/// Documents that are not cloud-config are returned unchanged.
pub fn authorize_key(config: &str, key: &str) -> String {
    if config.lines().next().map(str::trim_end) != Some("#cloud-config") {
        return config.to_string();
    }

    let mut lines: Vec<String> = config.lines().map(str::to_string).collect();
    match lines.iter().position(|l| l.starts_with(AUTHORIZED_KEYS)) {
        Some(at) => {
            let value = lines[at][AUTHORIZED_KEYS.len()..].trim().to_string();
            if let Some(items) = value.strip_prefix('[') {
                let items = items.trim_start();
                let sep = if items.starts_with(']') { "" } else { ", " };
                lines[at] = format!("{} [{}{}{}", AUTHORIZED_KEYS, key, sep, items);
            } else {
                let indent = lines
                    .get(at + 1)
                    .filter(|next| next.trim_start().starts_with('-'))
                    .map(|next| next.len() - next.trim_start().len())
                    .unwrap_or(2);
                lines.insert(at + 1, format!("{}- {}", " ".repeat(indent), key));
            }
        }
        None => {
            lines.insert(1, format!("  - {}", key));
            lines.insert(1, AUTHORIZED_KEYS.to_string());
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

const AUTHORIZED_KEYS: &str = "ssh_authorized_keys:";

/// A cluster of QEMU virtual machines.
pub struct QemuCluster {
    local: Arc<LocalCluster>,
    opts: QemuOptions,
    dhcp: DnsmasqConfig,
    discovery: DiscoveryClient,
    scratch: TempDir,
    machines: Mutex<Vec<Arc<QemuMachine>>>,
}

impl QemuCluster {
    /// Set up the local cluster the machines will live in.
    pub async fn new(opts: QemuOptions) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("kola-qemu-").tempdir()?;
        let dhcp = DnsmasqConfig::new(&opts.bridge);
        let local = LocalCluster::new(dhcp.clone()).await?;

        Ok(Self {
            local: Arc::new(local),
            discovery: DiscoveryClient::new(opts.discovery_base.clone()),
            opts,
            dhcp,
            scratch,
            machines: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Cluster for QemuCluster {
    async fn new_machine(&self, config: &str) -> Result<Arc<dyn Machine>> {
        let mut machines = self.machines.lock().await;
        let ordinal = machines.len();
        let (mac, ip) = match (self.dhcp.machine_mac(ordinal), self.dhcp.machine_ip(ordinal)) {
            (Some(mac), Some(ip)) => (mac, ip),
            _ => {
                return Err(PlatformError::Qemu(format!(
                    "no address reserved for machine {}",
                    ordinal
                )))
            }
        };

        let id = format!("qemu-{}", ordinal);
        let config_path = self.scratch.path().join(format!("{}.conf", id));
        let config = authorize_key(config, self.local.agent().public_key());
        tokio::fs::write(&config_path, config).await?;

        let tap = self.local.new_tap(&self.opts.bridge).await?;
        let args = self
            .opts
            .qemu_args(&tap.name, &mac, &config_path.display().to_string());
        let child = match self.local.new_command(&self.opts.qemu_binary, args).spawn().await {
            Ok(child) => child,
            Err(e) => {
                if let Err(del) = self.local.delete_tap(&tap).await {
                    tracing::warn!("deleting {}: {}", tap.name, del);
                }
                return Err(PlatformError::Qemu(format!("starting {}: {}", id, e)));
            }
        };

        let machine = Arc::new(QemuMachine {
            id,
            ip: ip.to_string(),
            tap,
            process: StdMutex::new(Some(child)),
            local: Arc::clone(&self.local),
            launcher: self.local.launcher(),
            ssh_user: self.opts.ssh_user.clone(),
            ssh_timeout: self.opts.ssh_timeout,
        });
        // Tracked before boot so a failed boot is still torn down with the cluster.
        machines.push(Arc::clone(&machine));
        drop(machines);

        machine.wait_for_ssh(self.opts.boot_timeout).await?;
        tracing::info!("{} up at {}", machine.id, machine.ip);
        Ok(machine)
    }

    async fn get_discovery_url(&self, size: usize) -> Result<String> {
        self.discovery.new_url(size).await
    }

    async fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.machines
            .lock()
            .await
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn Machine>)
            .collect()
    }

    async fn destroy(&self) -> Result<()> {
        let machines: Vec<_> = self.machines.lock().await.drain(..).collect();
        let mut errs = FirstError::new();
        for machine in machines {
            errs.record(&machine.id, machine.destroy().await);
        }
        errs.record("local cluster", self.local.destroy().await);
        errs.finish()
    }
}

/// A QEMU virtual machine.
pub struct QemuMachine {
    id: String,
    ip: String,
    tap: TunTap,
    process: StdMutex<Option<Child>>,
    local: Arc<LocalCluster>,
    launcher: Arc<dyn Launcher>,
    ssh_user: String,
    ssh_timeout: Duration,
}

impl QemuMachine {
    /// Poll until SSH answers or `limit` passes.
    async fn wait_for_ssh(&self, limit: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match self.ssh("true").await {
                Ok(_) => return Ok(()),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    tracing::debug!("{} never answered ssh: {}", self.id, e);
                    return Err(PlatformError::Timeout(format!("ssh on {}", self.id)));
                }
                Err(_) => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    }
}

#[async_trait]
impl Machine for QemuMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    async fn ssh_session(&self) -> Result<Box<dyn SshSession>> {
        let session = OpenSshSession::new(
            SshTarget::new(&self.ssh_user, &self.ip),
            Arc::clone(&self.launcher),
            self.ssh_timeout,
        )
        .env(
            SSH_AUTH_SOCK,
            self.local.agent().socket().display().to_string(),
        );
        Ok(Box::new(session))
    }

    async fn destroy(&self) -> Result<()> {
        let mut errs = FirstError::new();
        let child = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(child) = child {
            errs.record("qemu process", terminate(child).await.map_err(Into::into));
            errs.record(&self.tap.name, self.local.delete_tap(&self.tap).await);
        }
        errs.finish()
    }
}
