//! Build host access through the system `ssh` and `scp` binaries.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::tree::{begin_staging, commit_staging, discard};
use crate::{RemoteOutput, Transport, TransportError, TransportResult, remote_path, shell_quote};

/// Transport that shells out to OpenSSH.
///
/// Authentication is left to the user's ssh configuration (agent, keys,
/// `~/.ssh/config`). Commands run in batch mode so a missing key fails
/// instead of prompting.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    local_root: PathBuf,
    remote_base: String,
}

impl SshTransport {
    /// Create a transport for `host`.
    ///
    /// * `local_root` - workspace directory that relative file paths refer to
    /// * `remote_base` - base directory on the host that remote paths refer to
    pub fn new(host: impl Into<String>, local_root: impl Into<PathBuf>, remote_base: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            local_root: local_root.into(),
            remote_base: remote_base.into(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn absolute(&self, remote: &str) -> String {
        format!("{}/{}", self.remote_base.trim_end_matches('/'), remote)
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, recursive: bool, from: String, to: String) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string(), "-q".to_string()];
        if recursive {
            args.push("-r".to_string());
        }
        if let Some(port) = self.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args.push(from);
        args.push(to);
        args
    }

    fn remote_location(&self, remote: &str) -> String {
        format!("{}:{}", self.destination(), self.absolute(remote))
    }

    async fn ssh(&self, command: &str) -> TransportResult<RemoteOutput> {
        debug!("ssh {}: {}", self.destination(), command);
        let output = Command::new("ssh")
            .args(self.ssh_args(command))
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;
        Ok(output.into())
    }

    /// Run a remote command that must succeed.
    async fn ssh_checked(&self, command: &str) -> TransportResult<()> {
        let output = self.ssh(command).await?;
        if !output.success() {
            return Err(TransportError::CommandFailed {
                program: "ssh".to_string(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn scp(&self, recursive: bool, from: String, to: String) -> TransportResult<()> {
        debug!("scp {} -> {}", from, to);
        let output = Command::new("scp")
            .args(self.scp_args(recursive, from, to))
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                program: "scp".to_string(),
                source,
            })?;

        if !output.status.success() {
            let output = RemoteOutput::from(output);
            return Err(TransportError::CommandFailed {
                program: "scp".to_string(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Copy a remote path into a staging sibling of `local`, then move it
    /// into place.
    async fn fetch(&self, recursive: bool, local: &Path, remote: &str) -> TransportResult<()> {
        let staging = begin_staging(local).await?;
        if let Err(e) = self
            .scp(recursive, self.remote_location(remote), staging.display().to_string())
            .await
        {
            discard(&staging).await?;
            return Err(e);
        }
        commit_staging(&staging, local).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn transfer_files(&self, paths: &[PathBuf]) -> TransportResult<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let mut remote_paths = Vec::with_capacity(paths.len());
        let mut parents = BTreeSet::new();
        for path in paths {
            let remote = remote_path(path)?;
            if let Some((parent, _)) = remote.rsplit_once('/') {
                let _ = parents.insert(self.absolute(parent));
            }
            remote_paths.push(remote);
        }

        if !parents.is_empty() {
            let dirs: Vec<String> = parents.iter().map(|p| shell_quote(p)).collect();
            self.ssh_checked(&format!("mkdir -p {}", dirs.join(" "))).await?;
        }

        for (path, remote) in paths.iter().zip(&remote_paths) {
            let local = self.local_root.join(path);
            self.scp(false, local.display().to_string(), self.remote_location(remote))
                .await?;
        }

        info!("Transferred {} files to {}", paths.len(), self.host);
        Ok(())
    }

    async fn transfer_dir(&self, local: &Path, remote: &str) -> TransportResult<()> {
        let target = self.absolute(remote);
        let parent = target.rsplit_once('/').map_or(".", |(parent, _)| parent);
        self.ssh_checked(&format!(
            "rm -rf {} && mkdir -p {}",
            shell_quote(&target),
            shell_quote(parent)
        ))
        .await?;

        self.scp(true, local.display().to_string(), self.remote_location(remote))
            .await
    }

    async fn execute_remote_command(&self, command: &str) -> TransportResult<RemoteOutput> {
        self.ssh(command).await
    }

    async fn get_remote_file(&self, local: &Path, remote: &str) -> TransportResult<()> {
        self.fetch(false, local, remote).await
    }

    async fn get_remote_dir(&self, local: &Path, remote: &str) -> TransportResult<()> {
        self.fetch(true, local, remote).await
    }
}
