//! Creates the remote directory tree before any file is transferred
//!
//! A single transfer with an include-all-directories / exclude-all-files filter pair copies
//! just the directory structure of the local root. It is attempted once: if it fails the
//! destination is most likely misconfigured and retrying would not help.

use anyhow::Context;
use tracing::instrument;

use crate::remote;
use crate::transfer::Transport;

/// Arguments of the directory-only transfer.
pub fn args(
    local_root: &std::path::Path,
    remote_root: &std::path::Path,
    remote: &remote::Remote,
) -> Vec<std::ffi::OsString> {
    vec![
        "-a".into(),
        "-e".into(),
        remote.ssh_command().into(),
        "-f".into(),
        "+ */".into(),
        "-f".into(),
        "- *".into(),
        local_root.as_os_str().to_owned(),
        remote.target(remote_root),
    ]
}

/// Mirrors the directories of `local_root` under `remote_root` on the remote host.
#[instrument(skip(transport))]
pub async fn prepare<T: Transport>(
    transport: &T,
    local_root: &std::path::Path,
    remote_root: &std::path::Path,
    remote: &remote::Remote,
) -> anyhow::Result<()> {
    tracing::info!("syncing directories...");
    transport
        .run(&args(local_root, remote_root, remote))
        .await
        .with_context(|| {
            format!(
                "failed to create the directory structure of {:?} in {:?} on {}",
                local_root, remote_root, remote
            )
        })?;
    tracing::info!("directory structure is in place");
    Ok(())
}
