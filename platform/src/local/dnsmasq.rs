//! DHCP/DNS helper for a local cluster.
//!
//! Creates the cluster bridge and runs `dnsmasq` on it. Machine addresses
//! are fixed up front: ordinal `i` gets MAC `52:54:00:00:00:XX` and address
//! `10.0.0.XX` with `XX = i + 2`, so a machine's IP is known before it boots.

use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tempfile::TempDir;

use super::{link, terminate, Service};
use crate::error::{PlatformError, Result};
use crate::local::netns::Namespace;
use crate::teardown::FirstError;

/// First host number handed to machines; .1 is the bridge.
const FIRST_MACHINE_HOST: u8 = 2;

/// Bridge and DHCP settings for a local cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqConfig {
    /// Bridge interface the machines' taps are attached to.
    pub bridge: String,
    /// Number of static address reservations.
    pub reservations: u8,
    /// DNS domain handed out with leases.
    pub domain: String,
}

impl Default for DnsmasqConfig {
    fn default() -> Self {
        Self {
            bridge: "br0".into(),
            reservations: 48,
            domain: "local".into(),
        }
    }
}

impl DnsmasqConfig {
    /// Default settings on a bridge called `bridge`.
    pub fn new(bridge: &str) -> Self {
        Self {
            bridge: bridge.into(),
            ..Default::default()
        }
    }

    /// Address and prefix assigned to the bridge.
    pub fn bridge_cidr(&self) -> String {
        format!("{}/24", Self::gateway())
    }

    /// The bridge's own address.
    pub fn gateway() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    /// MAC address reserved for the machine with this ordinal.
    pub fn machine_mac(&self, ordinal: usize) -> Option<String> {
        self.host_number(ordinal)
            .map(|host| format!("52:54:00:00:00:{:02x}", host))
    }

    /// IP address reserved for the machine with this ordinal.
    pub fn machine_ip(&self, ordinal: usize) -> Option<Ipv4Addr> {
        self.host_number(ordinal)
            .map(|host| Ipv4Addr::new(10, 0, 0, host))
    }

    fn host_number(&self, ordinal: usize) -> Option<u8> {
        if ordinal >= usize::from(self.reservations) {
            return None;
        }
        u8::try_from(ordinal)
            .ok()
            .and_then(|o| o.checked_add(FIRST_MACHINE_HOST))
    }

    /// Build the `dnsmasq` arguments; leases are written under `lease_dir`.
    pub fn to_args(&self, lease_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--keep-in-foreground".into(),
            "--conf-file=/dev/null".into(),
            "--pid-file=".into(),
            "--bind-interfaces".into(),
            format!("--interface={}", self.bridge),
            "--except-interface=lo".into(),
            "--no-hosts".into(),
            format!("--domain={}", self.domain),
            "--dhcp-range=10.0.0.2,static,255.255.255.0,1h".into(),
            format!(
                "--dhcp-leasefile={}",
                lease_dir.join("dnsmasq.leases").display()
            ),
        ];

        for ordinal in 0..usize::from(self.reservations) {
            if let (Some(mac), Some(ip)) = (self.machine_mac(ordinal), self.machine_ip(ordinal)) {
                args.push(format!("--dhcp-host={},{}", mac, ip));
            }
        }

        args
    }
}

/// A running `dnsmasq` serving the cluster bridge.
#[derive(Debug)]
pub struct Dnsmasq {
    process: Mutex<Option<Child>>,
    lease_dir: Mutex<Option<TempDir>>,
}

impl Dnsmasq {
    /// Create the bridge and start dnsmasq inside `ns`.
    pub async fn start(ns: &Namespace, config: DnsmasqConfig) -> Result<Self> {
        let lease_dir = tempfile::Builder::new().prefix("kola-dnsmasq-").tempdir()?;
        let args = config.to_args(lease_dir.path());
        let bridge = config.bridge.clone();
        let cidr = config.bridge_cidr();

        // Everything below binds to the namespace it runs in.
        let child = ns
            .run(move || -> Result<Child> {
                link::set_up("lo").map_err(|e| PlatformError::link("loopback up failed", e))?;
                link::add_bridge(&bridge, &cidr)
                    .map_err(|e| PlatformError::link("bridge setup failed", e))?;
                Command::new("dnsmasq")
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| PlatformError::Dnsmasq(format!("spawn dnsmasq: {}", e)))
            })
            .await??;

        tracing::debug!("dnsmasq serving {}", config.bridge);
        Ok(Self {
            process: Mutex::new(Some(child)),
            lease_dir: Mutex::new(Some(lease_dir)),
        })
    }
}

#[async_trait]
impl Service for Dnsmasq {
    async fn close(&self) -> Result<()> {
        let mut errs = FirstError::new();

        let child = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(child) = child {
            errs.record("dnsmasq process", terminate(child).await.map_err(Into::into));
        }

        let dir = self
            .lease_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dir) = dir {
            errs.record("dnsmasq leases", dir.close().map_err(Into::into));
        }

        errs.finish()
    }
}
