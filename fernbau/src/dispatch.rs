//! Request dispatch
//!
//! Front ends (the CLI, or anything embedding the library) describe what
//! they want as a [`Request`]. [`dispatch`] runs it on the coordinator and
//! turns every result, including errors, into a user-facing [`Response`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{error, warn};

use crate::coordinator::{BuildCoordinator, BuildOutcome, DependencyEdit};
use crate::error::CoordinatorResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    PreviewChanges {
        source: Option<String>,
    },
    RunBuild {
        sources: Vec<String>,
    },
    RerunBuild {
        ignore_sources: Vec<String>,
        ignore_commands: BTreeMap<String, Vec<String>>,
    },
    ResetObjectList,
    FetchCompiledObjectList,
    RefreshRemoteSourceList,
    CheckRemoteSources,
    TransferAll,
    ShowDependencies {
        source: String,
    },
    EditDependencies(DependencyEdit),
    ListHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => f.write_str("info"),
            Level::Warning => f.write_str("warning"),
            Level::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub level: Level,
    pub message: String,
}

impl Response {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }
}

/// Run a request and describe the result.
pub async fn dispatch(coordinator: &BuildCoordinator, request: Request) -> Response {
    match handle(coordinator, request).await {
        Ok(response) => {
            if response.level == Level::Warning {
                warn!("{}", response.message);
            }
            response
        }
        Err(e) => {
            error!("{}", e);
            Response::error(e.to_string())
        }
    }
}

async fn handle(coordinator: &BuildCoordinator, request: Request) -> CoordinatorResult<Response> {
    let response = match request {
        Request::PreviewChanges { source } => {
            let changes = coordinator.preview_changes(source).await?;
            if changes.is_empty() {
                Response::info("No changes")
            } else {
                let mut lines = Vec::new();
                lines.extend(changes.new_objects.iter().map(|s| format!("new      {s}")));
                lines.extend(changes.changed_sources.iter().map(|s| format!("changed  {s}")));
                lines.extend(changes.stale_objects.iter().map(|s| format!("missing  {s}")));
                Response::info(lines.join("\n"))
            }
        }
        Request::RunBuild { sources } => {
            let sources = (!sources.is_empty()).then_some(sources);
            describe_outcome(coordinator.run_build(sources).await?)
        }
        Request::RerunBuild {
            ignore_sources,
            ignore_commands,
        } => describe_outcome(
            coordinator
                .rerun_build(ignore_sources, ignore_commands)
                .await?,
        ),
        Request::ResetObjectList => {
            let count = coordinator.reset_object_list().await?;
            Response::info(format!("Recorded {count} sources as built"))
        }
        Request::FetchCompiledObjectList => {
            let count = coordinator.fetch_compiled_object_list().await?;
            Response::info(format!("Fetched {count} fingerprints from the build host"))
        }
        Request::RefreshRemoteSourceList => {
            let path = coordinator.refresh_remote_source_list().await?;
            Response::info(format!("Remote source list saved to {}", path.display()))
        }
        Request::CheckRemoteSources => {
            let missing = coordinator.check_remote_sources().await?;
            if missing.is_empty() {
                Response::info("Remote source check succeeded")
            } else {
                Response::warning(format!(
                    "Remote source check failed, {} sources missing on the build host: {}",
                    missing.len(),
                    missing.join(", ")
                ))
            }
        }
        Request::TransferAll => {
            let count = coordinator.transfer_all().await?;
            Response::info(format!("Transferred {count} sources"))
        }
        Request::ShowDependencies { source } => {
            let view = coordinator.dependencies(&source).await?;
            Response::info(format!(
                "{}\n  depends on: {}\n  needed by:  {}",
                view.source,
                list_or_none(&view.depends_on),
                list_or_none(&view.dependents)
            ))
        }
        Request::EditDependencies(edit) => {
            let update = coordinator.edit_dependencies(edit).await?;
            if !update.changed {
                Response::info("Dependency list unchanged")
            } else if update.cycles.is_empty() {
                Response::info("Dependency list updated")
            } else {
                let cycles: Vec<String> = update.cycles.iter().map(|c| c.join(" -> ")).collect();
                Response::warning(format!(
                    "Dependency list updated, but it now contains cycles: {}",
                    cycles.join("; ")
                ))
            }
        }
        Request::ListHistory => {
            let snapshots = coordinator.history().await?;
            if snapshots.is_empty() {
                Response::info("No archived builds")
            } else {
                Response::info(snapshots.join("\n"))
            }
        }
    };
    Ok(response)
}

fn describe_outcome(outcome: BuildOutcome) -> Response {
    match outcome {
        BuildOutcome::NothingToBuild => Response::info("No sources to build"),
        BuildOutcome::Completed {
            succeeded,
            failed,
            snapshot,
        } => {
            if failed.is_empty() {
                Response::info(format!(
                    "Built {} sources (archived in {})",
                    succeeded.len(),
                    snapshot.display()
                ))
            } else {
                Response::warning(format!(
                    "Built {} sources, {} failed: {}",
                    succeeded.len(),
                    failed.len(),
                    failed.join(", ")
                ))
            }
        }
    }
}

fn list_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_outcome_levels() {
        assert_eq!(describe_outcome(BuildOutcome::NothingToBuild).level, Level::Info);

        let partial = describe_outcome(BuildOutcome::Completed {
            succeeded: vec!["a.c".into()],
            failed: vec!["b.c".into()],
            snapshot: PathBuf::from("history/x"),
        });
        assert_eq!(partial.level, Level::Warning);
        assert!(partial.message.contains("b.c"));
    }

    #[test]
    fn test_response_constructors() {
        assert!(Response::error("boom").is_error());
        assert!(!Response::info("ok").is_error());
        assert_eq!(Level::Warning.to_string(), "warning");
    }
}
