//! SSH execution primitives.
//!
//! Shells out to the OpenSSH `ssh` client. Where the process is started is
//! decided by a [`Launcher`]: the host for cloud machines, the cluster's
//! network namespace for local ones.

use std::io;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::cluster::SshSession;
use crate::error::Result;

/// Errors from SSH operations.
#[derive(Debug, Error)]
pub enum SshError {
    /// SSH command failed to execute (process spawn error).
    #[error("ssh spawn error: {0}")]
    Spawn(#[from] io::Error),

    /// SSH command returned non-zero exit code.
    #[error("ssh command failed on {host}: exit={exit_code}, output={output}")]
    CommandFailed {
        /// Target host.
        host: String,
        /// Exit code.
        exit_code: i32,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The command did not finish in time.
    #[error("ssh to {host} timed out after {secs}s")]
    Timeout {
        /// Target host.
        host: String,
        /// Limit that was exceeded.
        secs: u64,
    },
}

/// Starts a prepared command somewhere and waits for it.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Run `cmd` to completion, feeding `stdin` when given, and capture stdout and stderr.
    async fn output(&self, cmd: std::process::Command, stdin: Option<Vec<u8>>) -> io::Result<Output>;
}

/// Runs commands directly on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostLauncher;

#[async_trait]
impl Launcher for HostLauncher {
    async fn output(&self, cmd: std::process::Command, stdin: Option<Vec<u8>>) -> io::Result<Output> {
        let mut cmd = piped(cmd, stdin.is_some());
        let child = cmd.spawn()?;
        wait_with_input(child, stdin).await
    }
}

/// `cmd` with captured output, a stdin pipe when input will be fed, and
/// killed if its future is dropped.
pub(crate) fn piped(cmd: std::process::Command, with_stdin: bool) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(if with_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    cmd
}

/// Feed `stdin` to `child` and collect its output.
pub(crate) async fn wait_with_input(
    mut child: tokio::process::Child,
    stdin: Option<Vec<u8>>,
) -> io::Result<Output> {
    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
            pipe.write_all(&input).await?;
            pipe.shutdown().await
        })),
        _ => None,
    };

    let output = child.wait_with_output().await?;
    if let Some(writer) = writer {
        writer.await.map_err(io::Error::other)??;
    }
    Ok(output)
}

/// SSH target machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Address to connect to.
    pub host: String,
    /// SSH username.
    pub user: String,
    /// `ConnectTimeout` passed to ssh, in seconds.
    pub connect_timeout_secs: u64,
}

impl SshTarget {
    /// Target `user@host` with a 30 second connect timeout.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            connect_timeout_secs: 30,
        }
    }

    /// Build the `ssh` arguments for running `cmd` on this target.
    ///
    /// Host keys are not checked: every machine is freshly provisioned.
    pub fn ssh_args(&self, cmd: &str) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            format!("{}@{}", self.user, self.host),
            cmd.into(),
        ]
    }
}

/// One-shot SSH session backed by the OpenSSH client.
pub struct OpenSshSession {
    target: SshTarget,
    launcher: Arc<dyn Launcher>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl OpenSshSession {
    /// New session to `target`, started through `launcher`.
    pub fn new(target: SshTarget, launcher: Arc<dyn Launcher>, timeout: Duration) -> Self {
        Self {
            target,
            launcher,
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    /// Set an environment variable for the local `ssh` process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl SshSession for OpenSshSession {
    fn set_stdin(&mut self, input: Vec<u8>) {
        self.stdin = Some(input);
    }

    async fn combined_output(self: Box<Self>, cmd: &str) -> Result<Vec<u8>> {
        let mut command = std::process::Command::new("ssh");
        command.args(self.target.ssh_args(cmd));
        for (key, value) in &self.env {
            command.env(key, value);
        }

        tracing::debug!("ssh {}@{}: {}", self.target.user, self.target.host, cmd);
        let output = tokio::time::timeout(self.timeout, self.launcher.output(command, self.stdin))
            .await
            .map_err(|_| SshError::Timeout {
                host: self.target.host.clone(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(SshError::Spawn)?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            return Err(SshError::CommandFailed {
                host: self.target.host,
                exit_code: output.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&combined).to_string(),
            }
            .into());
        }

        Ok(combined)
    }
}
