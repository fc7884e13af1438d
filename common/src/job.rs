//! Sync jobs and the directory walk that produces them
//!
//! Every file under the local root becomes one [`SyncJob`] that transfers just that file into
//! the matching remote directory. The remote layout mirrors the local one under
//! `remote_root/<basename of local_root>`:
//!
//! ```text
//! /src/a.txt      -> /dst/src/
//! /src/sub/b.txt  -> /dst/src/sub/
//! ```
//!
//! Each job gets its own staging directory for partially received data, named after a SHA-256
//! digest of the file's base name. The staging directory is relative to the job's destination
//! directory, so files sharing a base name in different directories never share a staging path.

use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use sha2::Digest;
use tracing::instrument;

use crate::remote;
use crate::transfer;

/// Prefix of the per-job staging directory passed with `--partial-dir`.
pub const PARTIAL_DIR_PREFIX: &str = ".sync-part-";

/// Transfer of a single local file into a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    /// Absolute local path of the file.
    pub source_path: std::path::PathBuf,
    /// Remote directory the file is transferred into.
    pub destination_dir: std::path::PathBuf,
    /// `user@host`
    pub remote_address: String,
    /// Remote shell, e.g. `ssh -p 22`.
    pub ssh_command: String,
    /// Transfer tool flags, including this job's `--partial-dir`.
    pub transfer_options: Vec<String>,
    /// Hex SHA-256 of the file's base name.
    pub partial_marker: String,
}

impl SyncJob {
    /// Name of the staging directory used for partially transferred data.
    pub fn partial_dir(&self) -> String {
        format!("{PARTIAL_DIR_PREFIX}{}", self.partial_marker)
    }

    /// Full argument list for the transfer tool.
    pub fn args(&self) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec!["-e".into(), self.ssh_command.clone().into()];
        args.extend(self.transfer_options.iter().map(Into::into));
        args.push(self.source_path.clone().into_os_string());
        args.push(remote::target(&self.remote_address, &self.destination_dir));
        args
    }
}

/// Digest of a file's base name used to name its staging directory.
pub fn partial_marker(file_name: &std::ffi::OsStr) -> String {
    hex::encode(sha2::Sha256::digest(file_name.as_encoded_bytes()))
}

/// Resolves the local root to an absolute directory path without trailing slashes.
///
/// The base name of the result names the directory created under the remote root, so a root
/// without one (`/`) is rejected.
pub async fn resolve_local_root(
    local_root: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    let resolved = tokio::fs::canonicalize(local_root)
        .await
        .with_context(|| format!("cannot access local directory {:?}", local_root))?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &resolved))?;
    if !metadata.is_dir() {
        return Err(anyhow!("{:?} is not a directory", local_root));
    }
    if resolved.file_name().is_none() {
        return Err(anyhow!(
            "cannot sync {:?}: it has no name to create under the remote directory",
            &resolved
        ));
    }
    Ok(resolved)
}

/// Remote directory that mirrors `local_root` itself.
pub fn remote_base(
    local_root: &std::path::Path,
    remote_root: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    let name = local_root
        .file_name()
        .with_context(|| format!("local directory {:?} has no base name", local_root))?;
    Ok(remote_root.join(name))
}

/// Walks `local_root` and returns one job per file, in walk order.
///
/// Regular files and symlinks that do not point at a directory become jobs. Subdirectories that
/// cannot be read are logged and skipped; failing to read `local_root` itself is an error.
#[instrument(skip(remote, settings))]
pub async fn build(
    local_root: &std::path::Path,
    remote_root: &std::path::Path,
    remote: &remote::Remote,
    settings: &transfer::Settings,
) -> anyhow::Result<Vec<SyncJob>> {
    let base = remote_base(local_root, remote_root)?;
    let mut files = Vec::new();
    walk(local_root, &mut files).await?;
    let remote_address = remote.address();
    let ssh_command = remote.ssh_command();
    let base_options = settings.transfer_options();
    let mut jobs = Vec::with_capacity(files.len());
    for source_path in files {
        let parent = source_path
            .parent()
            .with_context(|| format!("{:?} has no parent directory", &source_path))?;
        let relative = parent
            .strip_prefix(local_root)
            .with_context(|| format!("{:?} is outside of {:?}", parent, local_root))?;
        let destination_dir = if relative.as_os_str().is_empty() {
            base.clone()
        } else {
            base.join(relative)
        };
        let file_name = source_path
            .file_name()
            .with_context(|| format!("{:?} has no file name", &source_path))?;
        let partial_marker = partial_marker(file_name);
        let mut transfer_options = base_options.clone();
        transfer_options.push(format!("--partial-dir={PARTIAL_DIR_PREFIX}{partial_marker}"));
        tracing::trace!("job: {:?} -> {:?}", &source_path, &destination_dir);
        jobs.push(SyncJob {
            source_path,
            destination_dir,
            remote_address: remote_address.clone(),
            ssh_command: ssh_command.clone(),
            transfer_options,
            partial_marker,
        });
    }
    tracing::debug!("found {} files under {:?}", jobs.len(), local_root);
    Ok(jobs)
}

#[async_recursion]
async fn walk(
    dir: &std::path::Path,
    files: &mut Vec<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
    let mut listing = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {:?}", entry.path()))?;
        listing.push((entry.path(), file_type));
    }
    listing.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
    let mut subdirs = Vec::new();
    for (path, file_type) in listing {
        if file_type.is_dir() {
            subdirs.push(path);
        } else if file_type.is_symlink() {
            // a dangling link has no metadata and is still transferred as a link
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_dir() => {
                    tracing::debug!("not following directory symlink {:?}", &path);
                }
                _ => files.push(path),
            }
        } else if file_type.is_file() {
            files.push(path);
        } else {
            tracing::debug!("skipping special file {:?}", &path);
        }
    }
    for subdir in subdirs {
        if let Err(error) = walk(&subdir, files).await {
            tracing::warn!("skipping {:?}: {:#}", &subdir, &error);
        }
    }
    Ok(())
}
