//! Local directory tree helpers shared by the transports.
//!
//! Fetches land in a sibling staging path first and only replace the local
//! target once the copy is complete, so a failed fetch never costs the state
//! that was already on disk.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

/// Replace `to` with a recursive copy of the directory `from`.
///
/// Returns the number of files copied.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    if !from.is_dir() {
        return Err(io::Error::other(format!(
            "{} is not a directory",
            from.display()
        )));
    }
    if to.exists() {
        std::fs::remove_dir_all(to)?;
    }
    std::fs::create_dir_all(to)?;

    let mut copied = 0;
    for entry in WalkDir::new(from).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            let _ = std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Sibling path a fetch of `local` is staged in
pub fn staging_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    local.with_file_name(name)
}

/// Create the parent of `local` and clear a staging path left behind by an
/// interrupted fetch.
pub(crate) async fn begin_staging(local: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(local);
    discard(&staging).await?;
    Ok(staging)
}

/// Move a completed staging path over `local`.
pub(crate) async fn commit_staging(staging: &Path, local: &Path) -> io::Result<()> {
    discard(local).await?;
    tokio::fs::rename(staging, local).await?;
    debug!("Replaced {}", local.display());
    Ok(())
}

/// Remove a file or directory if it exists.
pub(crate) async fn discard(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
