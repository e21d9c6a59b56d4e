//! Error types for the build coordinator

use std::path::PathBuf;

use fernbau_graph::GraphError;
use fernbau_remote::TransportError;

use crate::status::OperationKind;

/// Errors returned by coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0} is already running")]
    AlreadyRunning(OperationKind),

    #[error("Cannot read source {path}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported object type for {0}")]
    UnsupportedObjectType(String),

    #[error("Source path {0} is not inside the source root")]
    InvalidSource(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Remote build did not produce a report at {0}")]
    MissingBuildReport(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dependency error: {0}")]
    Graph(#[from] GraphError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
