//! Remote build host access for fernbau.
//!
//! The coordinator never talks to a build host directly. It goes through the
//! [`Transport`] trait, which covers the narrow channel a remote build needs:
//! pushing files and directories, running one shell command at a time and
//! pulling results back.
//!
//! Two implementations are provided:
//! - [`SshTransport`]: drives the system `ssh` and `scp` binaries
//! - [`LocalTransport`]: treats a local directory as the remote host
//!
//! Remote paths are always relative to the remote base directory and use
//! forward slashes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub mod local;
pub mod ssh;
pub mod tree;

pub use local::LocalTransport;
pub use ssh::SshTransport;
pub use tree::copy_tree;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Remote path not found: {0}")]
    RemoteNotFound(String),

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Outcome of a remote shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Exit code, `None` when the command was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human readable exit status for logs and errors
    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }
}

impl From<std::process::Output> for RemoteOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Channel to a remote build host.
///
/// All operations are fatal to the current build cycle when they fail,
/// except that a non-zero exit of a remote command is reported through
/// [`RemoteOutput`] and left to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Copy workspace files to the same relative paths on the remote host.
    async fn transfer_files(&self, paths: &[PathBuf]) -> TransportResult<()>;

    /// Copy a local directory tree to `remote`, replacing what was there.
    async fn transfer_dir(&self, local: &Path, remote: &str) -> TransportResult<()>;

    /// Run one shell command on the remote host.
    async fn execute_remote_command(&self, command: &str) -> TransportResult<RemoteOutput>;

    /// Fetch a single remote file to `local`.
    ///
    /// `local` is left untouched when the fetch fails.
    async fn get_remote_file(&self, local: &Path, remote: &str) -> TransportResult<()>;

    /// Fetch a remote directory tree to `local`, replacing what was there.
    ///
    /// `local` is only replaced once the whole tree has arrived.
    async fn get_remote_dir(&self, local: &Path, remote: &str) -> TransportResult<()>;
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Convert a relative local path into a remote path with forward slashes.
///
/// Absolute paths and `..` components are rejected since they would escape
/// the remote base directory.
pub fn remote_path(path: &Path) -> TransportResult<String> {
    use std::path::Component;

    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(TransportError::InvalidPath(path.display().to_string())),
        }
    }

    if parts.is_empty() {
        return Err(TransportError::InvalidPath(path.display().to_string()));
    }
    Ok(parts.join("/"))
}
