//! JSON persistence for fingerprint table, change set, plan and dependencies
//!
//! Documents are written pretty-printed with a trailing newline. Writes go
//! to a sibling temporary file that is renamed into place, so readers never
//! see a half-written document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fernbau_graph::DependencyGraph;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::changes::{ChangeSet, FingerprintTable};
use crate::config::PathsConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::plan::{BuildPlan, BuildReport};

/// Declared dependency list as stored on disk
pub type DependencyList = BTreeMap<String, Vec<String>>;

/// Write `value` as JSON to `path`, atomically.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoordinatorResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a JSON document, or `None` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> CoordinatorResult<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persisted documents of one workspace
#[derive(Debug, Clone)]
pub struct PlanStore {
    workspace: PathBuf,
    paths: PathsConfig,
}

impl PlanStore {
    pub fn new(workspace: impl Into<PathBuf>, paths: PathsConfig) -> Self {
        Self {
            workspace: workspace.into(),
            paths,
        }
    }

    /// Absolute location of a workspace-relative path
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.workspace.join(relative)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.resolve(&self.paths.temp_dir)
    }

    pub fn build_output_dir(&self) -> PathBuf {
        self.resolve(&self.paths.build_output)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.paths.log_dir)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.resolve(&self.paths.history_dir)
    }

    pub fn report_path(&self) -> PathBuf {
        self.build_output_dir().join(&self.paths.build_report)
    }

    pub async fn load_table(&self) -> CoordinatorResult<FingerprintTable> {
        let path = self.resolve(&self.paths.fingerprint_table);
        let table: FingerprintTable = read_json(&path).await?.unwrap_or_default();
        debug!("Loaded {} fingerprints", table.len());
        Ok(table)
    }

    pub async fn save_table(&self, table: &FingerprintTable) -> CoordinatorResult<()> {
        write_json(&self.resolve(&self.paths.fingerprint_table), table).await?;
        info!("Saved {} fingerprints", table.len());
        Ok(())
    }

    pub async fn save_change_set(&self, changes: &ChangeSet) -> CoordinatorResult<()> {
        write_json(&self.resolve(&self.paths.change_set), changes).await
    }

    pub async fn load_plan(&self) -> CoordinatorResult<Option<BuildPlan>> {
        read_json(&self.resolve(&self.paths.build_plan)).await
    }

    pub async fn save_plan(&self, plan: &BuildPlan) -> CoordinatorResult<()> {
        write_json(&self.resolve(&self.paths.build_plan), plan).await?;
        info!("Saved build plan with {} targets", plan.targets.len());
        Ok(())
    }

    /// Remove local build output so a stale report is never read
    pub async fn clear_build_output(&self) -> CoordinatorResult<()> {
        let dir = self.build_output_dir();
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub async fn load_report(&self) -> CoordinatorResult<BuildReport> {
        let path = self.report_path();
        read_json(&path)
            .await?
            .ok_or(CoordinatorError::MissingBuildReport(path))
    }

    pub async fn load_dependencies(&self) -> CoordinatorResult<DependencyGraph<String>> {
        let list: DependencyList = read_json(&self.resolve(&self.paths.dependency_list))
            .await?
            .unwrap_or_default();
        Ok(DependencyGraph::from_declared(list))
    }

    pub async fn save_dependencies(&self, graph: &DependencyGraph<String>) -> CoordinatorResult<()> {
        let list: DependencyList = graph
            .declared()
            .into_iter()
            .map(|(source, deps)| (source.clone(), deps.into_iter().cloned().collect()))
            .collect();
        write_json(&self.resolve(&self.paths.dependency_list), &list).await?;
        info!("Saved dependencies of {} sources", list.len());
        Ok(())
    }
}
