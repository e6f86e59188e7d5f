//! # kola-platform
//!
//! Cluster backends for the kola integration-test harness.
//!
//! - [`cluster`]: the `Cluster` / `Machine` / `SshSession` contracts every backend implements
//! - [`local`]: an isolated network namespace with an SSH agent, dnsmasq and tap/bridge wiring
//! - [`qemu`]: QEMU virtual machines running inside a local cluster
//! - [`gce`]: Google Compute Engine instances driven through `gcloud`
//! - [`ssh`]: OpenSSH command execution on a host or inside a namespace
//! - [`discovery`]: etcd-style discovery endpoint allocation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod discovery;
pub mod error;
pub mod gce;
pub mod local;
pub mod qemu;
pub mod ssh;
pub mod teardown;

pub use cluster::{Cluster, Machine, SshSession, TestCluster, KOLET_REMOTE_PATH};
pub use error::{PlatformError, Result};
pub use gce::{GceCluster, GceOptions};
pub use qemu::{QemuCluster, QemuOptions};
