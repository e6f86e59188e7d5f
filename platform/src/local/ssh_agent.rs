//! SSH agent bound to a local cluster.
//!
//! Runs `ssh-agent` in the foreground on a socket in a private temp
//! directory and loads a freshly generated ed25519 key into it. Commands run
//! against the local cluster reach it through `SSH_AUTH_SOCK`.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::{terminate, Service};
use crate::error::{PlatformError, Result};
use crate::local::netns::Namespace;
use crate::teardown::FirstError;

/// How long to wait for the agent socket to appear.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// A running `ssh-agent` process.
#[derive(Debug)]
pub struct SshAgent {
    socket: PathBuf,
    public_key: String,
    dir: Mutex<Option<TempDir>>,
    process: Mutex<Option<Child>>,
}

impl SshAgent {
    /// Start an agent through `ns` and load a new key into it.
    pub async fn new(ns: &Namespace) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("kola-agent-").tempdir()?;
        let socket = dir.path().join("agent.sock");

        let mut cmd = Command::new("ssh-agent");
        cmd.arg("-D")
            .arg("-a")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = ns
            .run(move || cmd.spawn())
            .await?
            .map_err(|e| PlatformError::SshAgent(format!("spawn ssh-agent: {}", e)))?;

        let mut agent = Self {
            socket,
            public_key: String::new(),
            dir: Mutex::new(Some(dir)),
            process: Mutex::new(Some(child)),
        };

        match agent.load_key().await {
            Ok(key) => {
                agent.public_key = key;
                tracing::debug!("ssh agent listening on {}", agent.socket.display());
                Ok(agent)
            }
            Err(e) => {
                if let Err(close_err) = agent.close().await {
                    tracing::warn!("closing half-started ssh agent: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Path of the agent's socket.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// OpenSSH public key of the identity loaded into the agent.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Wait for the socket, generate a key and add it. Returns the public key.
    async fn load_key(&self) -> Result<String> {
        let deadline = tokio::time::Instant::now() + SOCKET_TIMEOUT;
        while !self.socket.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(PlatformError::Timeout("ssh-agent socket".into()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let key_dir = self
            .socket
            .parent()
            .ok_or_else(|| PlatformError::SshAgent("socket has no parent directory".into()))?;
        let key = key_dir.join("id_ed25519");

        let keygen = tokio::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "kola", "-f"])
            .arg(&key)
            .output()
            .await?;
        if !keygen.status.success() {
            return Err(PlatformError::SshAgent(format!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&keygen.stderr)
            )));
        }

        let add = tokio::process::Command::new("ssh-add")
            .arg(&key)
            .env("SSH_AUTH_SOCK", &self.socket)
            .output()
            .await?;
        if !add.status.success() {
            return Err(PlatformError::SshAgent(format!(
                "ssh-add failed: {}",
                String::from_utf8_lossy(&add.stderr)
            )));
        }

        let public = tokio::fs::read_to_string(key.with_extension("pub")).await?;
        Ok(public.trim().to_string())
    }
}

#[async_trait]
impl Service for SshAgent {
    /// Stop the agent and remove its socket directory.
    async fn close(&self) -> Result<()> {
        let mut errs = FirstError::new();

        let child = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(child) = child {
            errs.record("ssh-agent process", terminate(child).await.map_err(Into::into));
        }

        let dir = self
            .dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dir) = dir {
            errs.record("ssh-agent socket", dir.close().map_err(Into::into));
        }

        errs.finish()
    }
}
