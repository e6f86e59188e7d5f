//! Copying files to machines.
//!
//! There is no scp: the file is streamed over the session's stdin into
//! `install`, which creates it with the right mode in one step.

use std::path::Path;

use kola_platform::{Machine, Result};

/// Remote command that writes stdin to `remote` as an executable.
pub fn install_command(remote: &str) -> String {
    format!("install -m 0755 /dev/stdin {}", remote)
}

/// Copy the local file `src` to `remote` on `machine`, mode 0755.
pub async fn scp_file(machine: &dyn Machine, src: &Path, remote: &str) -> Result<()> {
    let data = tokio::fs::read(src).await?;
    tracing::debug!(
        "copying {} ({} bytes) to {}:{}",
        src.display(),
        data.len(),
        machine.id(),
        remote
    );

    let mut session = machine.ssh_session().await?;
    session.set_stdin(data);
    session.combined_output(&install_command(remote)).await?;
    Ok(())
}
