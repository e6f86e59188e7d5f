//! etcd cluster bootstrap through a discovery endpoint.

use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use kola_platform::{Machine, TestCluster};

use crate::error::RegistryError;
use crate::registry::{Registry, Test};

const CLUSTER_SIZE: usize = 3;

/// How long each member may take to report a healthy cluster.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(120);

const CLOUD_CONFIG: &str = r#"#cloud-config

coreos:
  etcd:
    name: $name
    discovery: $discovery
    addr: $private_ipv4:4001
    peer-addr: $private_ipv4:7001
  units:
    - name: etcd.service
      command: start
"#;

/// Register `etcd.Discovery`.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        Test::new("etcd.Discovery", run)
            .cloud_config(CLOUD_CONFIG)
            .cluster_size(CLUSTER_SIZE),
    )
}

fn run(cluster: TestCluster) -> BoxFuture<'static, anyhow::Result<()>> {
    discovery(cluster).boxed()
}

/// Every member must see a healthy cluster of the expected size.
async fn discovery(cluster: TestCluster) -> anyhow::Result<()> {
    let machines = cluster.machines().await;
    if machines.len() != CLUSTER_SIZE {
        bail!("expected {} machines, got {}", CLUSTER_SIZE, machines.len());
    }

    for machine in &machines {
        wait_healthy(machine.as_ref())
            .await
            .with_context(|| format!("checking etcd on {}", machine.id()))?;
    }
    Ok(())
}

async fn wait_healthy(machine: &dyn Machine) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + HEALTH_TIMEOUT;
    loop {
        let result = machine.ssh("etcdctl cluster-health").await;
        match result {
            Ok(out) if is_healthy(&String::from_utf8_lossy(&out)) => return Ok(()),
            Ok(out) if tokio::time::Instant::now() >= deadline => {
                bail!("unhealthy: {}", String::from_utf8_lossy(&out).trim())
            }
            Err(e) if tokio::time::Instant::now() >= deadline => return Err(e.into()),
            _ => tokio::time::sleep(Duration::from_secs(5)).await,
        }
    }
}

/// `etcdctl cluster-health` output for a healthy cluster of [`CLUSTER_SIZE`].
fn is_healthy(output: &str) -> bool {
    let members = output
        .lines()
        .filter(|l| l.starts_with("member ") && l.contains("is healthy"))
        .count();
    members == CLUSTER_SIZE && output.contains("cluster is healthy")
}
