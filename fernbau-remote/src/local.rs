//! A local directory standing in for the remote build host.
//!
//! Useful for trying the build cycle without a second machine, and for
//! tests. Commands run through `sh -c` with the remote root as working
//! directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::tree::{begin_staging, commit_staging, discard};
use crate::{RemoteOutput, Transport, TransportError, TransportResult, copy_tree, remote_path};

#[derive(Debug, Clone)]
pub struct LocalTransport {
    local_root: PathBuf,
    remote_root: PathBuf,
}

impl LocalTransport {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }

    fn resolve(&self, remote: &str) -> TransportResult<PathBuf> {
        let relative = remote_path(Path::new(remote))?;
        Ok(self.remote_root.join(relative))
    }
}

async fn copy_tree_blocking(from: PathBuf, to: PathBuf) -> TransportResult<usize> {
    Ok(tokio::task::spawn_blocking(move || copy_tree(&from, &to)).await??)
}

#[async_trait]
impl Transport for LocalTransport {
    async fn transfer_files(&self, paths: &[PathBuf]) -> TransportResult<()> {
        for path in paths {
            let target = self.resolve(&remote_path(path)?)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let _ = tokio::fs::copy(self.local_root.join(path), &target).await?;
        }
        info!("Copied {} files to {}", paths.len(), self.remote_root.display());
        Ok(())
    }

    async fn transfer_dir(&self, local: &Path, remote: &str) -> TransportResult<()> {
        let target = self.resolve(remote)?;
        let copied = copy_tree_blocking(local.to_path_buf(), target).await?;
        debug!("Copied {} files into {}", copied, remote);
        Ok(())
    }

    async fn execute_remote_command(&self, command: &str) -> TransportResult<RemoteOutput> {
        debug!("sh -c {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.remote_root)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: "sh".to_string(),
                source,
            })?;
        Ok(output.into())
    }

    async fn get_remote_file(&self, local: &Path, remote: &str) -> TransportResult<()> {
        let source = self.resolve(remote)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(TransportError::RemoteNotFound(remote.to_string()));
        }
        let staging = begin_staging(local).await?;
        if let Err(e) = tokio::fs::copy(&source, &staging).await {
            discard(&staging).await?;
            return Err(e.into());
        }
        commit_staging(&staging, local).await?;
        Ok(())
    }

    async fn get_remote_dir(&self, local: &Path, remote: &str) -> TransportResult<()> {
        let source = self.resolve(remote)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(TransportError::RemoteNotFound(remote.to_string()));
        }
        let staging = begin_staging(local).await?;
        let copied = match copy_tree_blocking(source, staging.clone()).await {
            Ok(copied) => copied,
            Err(e) => {
                discard(&staging).await?;
                return Err(e);
            }
        };
        commit_staging(&staging, local).await?;
        debug!("Fetched {} files from {}", copied, remote);
        Ok(())
    }
}
