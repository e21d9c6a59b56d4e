//! Build coordinator
//!
//! Drives one build cycle against a remote build host:
//!
//! 1. Preview: detect changes, expand through the dependency graph, order
//!    and persist the change set and plan
//! 2. Stop early when there is nothing to build
//! 3. Validate remote settings and check the build host is prepared
//! 4. Transfer the planned sources
//! 5. Hand over the plan (transfer it or let the remote tool generate one)
//! 6. Run the remote build
//! 7. Retrieve build output, temp and log directories
//! 8. Update the fingerprint table from the per-source report
//! 9. Persist the table and archive the cycle
//!
//! The fingerprint table is only written in step 9, so a cycle that fails
//! anywhere before leaves it untouched. Step 9 also records the per-source
//! outcome in the stored plan, which is what a rerun starts from.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use fernbau_graph::DependencyGraph;
use fernbau_remote::{RemoteOutput, Transport, TransportError, remote_path, shell_quote};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::changes::{
    Candidates, ChangeDetector, ChangeSet, Detection, FingerprintTable, fingerprint_file,
    normalize_source,
};
use crate::config::{CONFIG_FILE, FernbauConfig, PlanPolicy, RemoteTarget};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::history::HistoryArchiver;
use crate::orderer::{BuildOrderer, Exclusions, ObjectTypePrecedence, OrderedPlan};
use crate::plan::{BuildPlan, BuildReport, BuildStatus};
use crate::status::{OperationKind, RunState, RunStatusRegistry};
use crate::store::PlanStore;

/// Result of a build cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum BuildOutcome {
    /// The plan was empty; nothing was sent to the build host
    NothingToBuild,

    /// The remote build ran and its report was applied.
    ///
    /// A non-empty `failed` list means the build partially failed.
    Completed {
        succeeded: Vec<String>,
        failed: Vec<String>,
        snapshot: PathBuf,
    },
}

impl BuildOutcome {
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, BuildOutcome::Completed { failed, .. } if !failed.is_empty())
    }
}

/// Edit of the declared dependency list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyEdit {
    /// `source` depends on `dependency`
    Add { source: String, dependency: String },
    /// `source` is a dependency of `dependent`
    AddDependent { source: String, dependent: String },
    Remove { source: String, dependency: String },
    RemoveDependent { source: String, dependent: String },
}

/// Result of a dependency list edit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DependencyUpdate {
    pub changed: bool,
    /// Cycles in the list after the edit
    pub cycles: Vec<Vec<String>>,
}

/// Where step 1 takes its targets from
enum PlanSource {
    Detect(Candidates),
    /// Unfinished targets of the stored plan
    Previous,
}

/// Fetched copy of the build host's fingerprint table, inside the temp dir
const REMOTE_TABLE_FILE: &str = "object-builds-remote.json";

/// Direct neighbours of a source in the dependency list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DependencyView {
    pub source: String,
    pub depends_on: Vec<String>,
    pub dependents: Vec<String>,
}

pub struct BuildCoordinator {
    workspace: PathBuf,
    config: FernbauConfig,
    transport: Arc<dyn Transport>,
    store: PlanStore,
    archiver: HistoryArchiver,
    status: RunStatusRegistry,
}

impl BuildCoordinator {
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: FernbauConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let workspace = workspace.into();
        let store = PlanStore::new(&workspace, config.paths.clone());
        let archiver = HistoryArchiver::new(store.history_dir());
        Self {
            workspace,
            config,
            transport,
            store,
            archiver,
            status: RunStatusRegistry::new(),
        }
    }

    pub fn state(&self, kind: OperationKind) -> RunState {
        self.status.state(kind)
    }

    fn detector(&self) -> ChangeDetector {
        ChangeDetector::new(
            self.workspace.join(&self.config.source_dir),
            &self.config.supported_object_types,
        )
    }

    fn orderer(&self) -> BuildOrderer {
        BuildOrderer::new(
            ObjectTypePrecedence::new(&self.config.object_type_precedence),
            self.config.source_commands.clone(),
        )
    }

    /// Detect what changed since the last successful builds.
    pub async fn preview_changes(&self, source: Option<String>) -> CoordinatorResult<ChangeSet> {
        let _permit = self.status.try_acquire(OperationKind::Preview)?;

        let candidates = match source {
            Some(source) => Candidates::Explicit(vec![source]),
            None => Candidates::WholeTree,
        };
        let table = self.store.load_table().await?;
        let detector = self.detector();
        let detection =
            tokio::task::spawn_blocking(move || detector.detect(&candidates, &table)).await??;

        self.store.save_change_set(&detection.changes).await?;
        info!(
            "{} new, {} changed sources",
            detection.changes.new_objects.len(),
            detection.changes.changed_sources.len()
        );
        Ok(detection.changes)
    }

    /// Run a full build cycle for the whole tree or the given sources.
    pub async fn run_build(&self, sources: Option<Vec<String>>) -> CoordinatorResult<BuildOutcome> {
        let _permit = self.status.try_acquire(OperationKind::Build)?;

        let candidates = match sources {
            Some(list) if !list.is_empty() => Candidates::Explicit(list),
            _ => Candidates::WholeTree,
        };
        self.build_cycle(PlanSource::Detect(candidates), Exclusions::default())
            .await
    }

    /// Build the targets of the stored plan that did not succeed, leaving
    /// out ignored sources and ignored command overrides.
    ///
    /// Without a stored plan the whole tree is detected as in
    /// [`run_build`](Self::run_build).
    pub async fn rerun_build(
        &self,
        ignore_sources: Vec<String>,
        ignore_commands: BTreeMap<String, Vec<String>>,
    ) -> CoordinatorResult<BuildOutcome> {
        let _permit = self.status.try_acquire(OperationKind::Build)?;

        let exclusions = Exclusions {
            sources: ignore_sources.into_iter().collect(),
            commands: ignore_commands
                .into_iter()
                .map(|(source, commands)| (source, commands.into_iter().collect::<HashSet<_>>()))
                .collect(),
        };
        self.build_cycle(PlanSource::Previous, exclusions).await
    }

    /// Push every supported source to the build host without building.
    ///
    /// Returns the number of files sent.
    pub async fn transfer_all(&self) -> CoordinatorResult<usize> {
        let _permit = self.status.try_acquire(OperationKind::Build)?;

        let remote = self.config.validate_remote()?;
        self.check_host_ready(&remote).await?;

        let detector = self.detector();
        let sources = tokio::task::spawn_blocking(move || detector.discover()).await??;
        let files: Vec<PathBuf> = sources
            .iter()
            .map(|source| self.config.source_dir.join(source))
            .collect();
        self.transport.transfer_files(&files).await?;
        info!("Transferred all {} sources", files.len());
        Ok(files.len())
    }

    /// Replace the fingerprint table with the one kept on the build host.
    /// Returns the number of entries.
    ///
    /// Like [`reset_object_list`](Self::reset_object_list) this records
    /// builds that no local report confirmed.
    pub async fn fetch_compiled_object_list(&self) -> CoordinatorResult<usize> {
        let _permit = self.status.try_acquire(OperationKind::ObjectListReset)?;

        let _ = self.config.validate_remote()?;
        let remote = remote_path(&self.config.paths.fingerprint_table)?;
        let fetched = self.store.temp_dir().join(REMOTE_TABLE_FILE);
        self.transport.get_remote_file(&fetched, &remote).await?;

        let json = tokio::fs::read_to_string(&fetched).await?;
        tokio::fs::remove_file(&fetched).await?;
        let table: FingerprintTable = serde_json::from_str(&json)?;

        self.store.save_table(&table).await?;
        info!("Fetched {} fingerprints from the build host", table.len());
        Ok(table.len())
    }

    /// Local sources that have no copy on the build host, sorted.
    pub async fn check_remote_sources(&self) -> CoordinatorResult<Vec<String>> {
        let _permit = self.status.try_acquire(OperationKind::RemoteSourceList)?;

        let remote = self.config.validate_remote()?;
        self.check_host_ready(&remote).await?;

        let root = if self
            .config
            .source_dir
            .components()
            .all(|c| c == Component::CurDir)
        {
            None
        } else {
            Some(remote_path(&self.config.source_dir)?)
        };
        let command = format!(
            "cd {} || exit 1; find {} -type f",
            shell_quote(remote.base_dir),
            shell_quote(root.as_deref().unwrap_or("."))
        );
        let listing = self.run_checked(&command).await?;

        let prefix = root.map(|r| format!("{r}/"));
        let present: HashSet<String> = listing
            .stdout
            .lines()
            .filter_map(|line| match &prefix {
                Some(prefix) => line.strip_prefix(prefix.as_str()),
                None => Some(line),
            })
            .filter_map(normalize_source)
            .collect();

        let detector = self.detector();
        let local = tokio::task::spawn_blocking(move || detector.discover()).await??;
        let missing: Vec<String> = local
            .into_iter()
            .filter(|source| !present.contains(source))
            .collect();
        for source in &missing {
            debug!("{} has no copy on the build host", source);
        }
        Ok(missing)
    }

    /// Replace the fingerprint table with the fingerprints of every source
    /// on disk. Returns the number of entries.
    ///
    /// This marks the whole tree as built without a remote round-trip.
    pub async fn reset_object_list(&self) -> CoordinatorResult<usize> {
        let _permit = self.status.try_acquire(OperationKind::ObjectListReset)?;

        let detector = self.detector();
        let table = tokio::task::spawn_blocking(move || detector.fingerprint_all()).await??;
        self.store.save_table(&table).await?;
        Ok(table.len())
    }

    /// Ask the build host for its source list and fetch it.
    ///
    /// Returns the local path of the fetched list.
    pub async fn refresh_remote_source_list(&self) -> CoordinatorResult<PathBuf> {
        let _permit = self.status.try_acquire(OperationKind::RemoteSourceList)?;

        let remote = self.config.validate_remote()?;
        self.check_host_ready(&remote).await?;

        if tokio::fs::try_exists(self.workspace.join(CONFIG_FILE)).await? {
            self.transport
                .transfer_files(&[PathBuf::from(CONFIG_FILE)])
                .await?;
        }

        let command = self.tool_command(&remote, "gen_src_list", None, false);
        let _ = self.run_checked(&command).await?;

        let local = self.store.resolve(&self.config.paths.remote_source_list);
        self.transport
            .get_remote_file(&local, &self.config.remote.source_list)
            .await?;
        info!("Fetched remote source list to {}", local.display());
        Ok(local)
    }

    /// Direct dependencies and dependents of a source
    pub async fn dependencies(&self, source: &str) -> CoordinatorResult<DependencyView> {
        let graph = self.store.load_dependencies().await?;
        let key = source.to_string();
        Ok(DependencyView {
            source: key.clone(),
            depends_on: graph.dependencies(&key).into_iter().cloned().collect(),
            dependents: graph.dependents(&key).into_iter().cloned().collect(),
        })
    }

    /// Apply an edit to the dependency list.
    ///
    /// Edits that close a cycle are kept; the cycles are reported so the
    /// caller can warn about them.
    pub async fn edit_dependencies(
        &self,
        edit: DependencyEdit,
    ) -> CoordinatorResult<DependencyUpdate> {
        let mut graph: DependencyGraph<String> = self.store.load_dependencies().await?;
        let changed = match edit {
            DependencyEdit::Add { source, dependency } => graph.add_dependency(source, dependency)?,
            DependencyEdit::AddDependent { source, dependent } => {
                graph.add_dependent(source, dependent)?
            }
            DependencyEdit::Remove { source, dependency } => {
                graph.remove_dependency(&source, &dependency)
            }
            DependencyEdit::RemoveDependent { source, dependent } => {
                graph.remove_dependent(&source, &dependent)
            }
        };
        if !changed {
            return Ok(DependencyUpdate::default());
        }
        self.store.save_dependencies(&graph).await?;

        let cycles = graph.find_cycles();
        for cycle in &cycles {
            warn!("Dependency list contains the cycle {}", cycle.join(" -> "));
        }
        Ok(DependencyUpdate { changed, cycles })
    }

    /// Archived snapshot names, oldest first
    pub async fn history(&self) -> CoordinatorResult<Vec<String>> {
        self.archiver.list().await
    }

    async fn build_cycle(
        &self,
        source: PlanSource,
        exclusions: Exclusions,
    ) -> CoordinatorResult<BuildOutcome> {
        // Step 1
        let ordered = {
            let _preview = self.status.try_acquire(OperationKind::Preview)?;
            match source {
                PlanSource::Detect(candidates) => self.prepare_plan(candidates, exclusions).await?,
                PlanSource::Previous => match self.store.load_plan().await? {
                    Some(previous) => self.prepare_retry(previous, exclusions).await?,
                    None => {
                        info!("No stored plan, detecting changes");
                        self.prepare_plan(Candidates::WholeTree, exclusions).await?
                    }
                },
            }
        };
        let mut plan = ordered.plan;

        // Step 2
        if plan.is_empty() {
            info!("No sources to build");
            return Ok(BuildOutcome::NothingToBuild);
        }

        // Step 3
        let remote = self.config.validate_remote()?;
        self.check_host_ready(&remote).await?;

        // Step 4
        let files: Vec<PathBuf> = plan
            .sources()
            .map(|source| self.config.source_dir.join(source))
            .collect();
        info!("Transferring {} sources", files.len());
        self.transport.transfer_files(&files).await?;

        // Step 5
        match self.config.plan_policy {
            PlanPolicy::Transfer => {
                let temp = remote_path(&self.config.paths.temp_dir)?;
                self.transport
                    .transfer_dir(&self.store.temp_dir(), &temp)
                    .await?;
            }
            PlanPolicy::Generate => {
                let single = match plan.targets.as_slice() {
                    [target] => Some(target.source.as_str()),
                    _ => None,
                };
                let command = self.tool_command(&remote, "create", single, true);
                let _ = self.run_checked(&command).await?;
            }
        }

        // Step 6
        info!("Running remote build of {} targets", plan.targets.len());
        let command = self.tool_command(&remote, "run", None, true);
        let output = self.transport.execute_remote_command(&command).await?;
        if output.success() {
            debug!("Remote build finished");
        } else {
            warn!(
                "Remote build exited with {}: {}",
                output.status_text(),
                output.stderr.trim()
            );
        }

        // Step 7
        self.retrieve_results().await?;

        // Step 8
        let report = self.store.load_report().await?;
        let (table, succeeded, failed) = self.apply_report(&plan, &report).await?;

        // Step 9
        self.store.save_table(&table).await?;
        plan.record(&report);
        self.store.save_plan(&plan).await?;
        let snapshot = self.archiver.archive(&plan, &self.store.temp_dir()).await?;

        info!(
            "Build finished: {} succeeded, {} failed",
            succeeded.len(),
            failed.len()
        );
        Ok(BuildOutcome::Completed {
            succeeded,
            failed,
            snapshot,
        })
    }

    async fn prepare_plan(
        &self,
        candidates: Candidates,
        exclusions: Exclusions,
    ) -> CoordinatorResult<OrderedPlan> {
        let table = self.store.load_table().await?;
        let graph = self.store.load_dependencies().await?;
        let detector = self.detector();
        let orderer = self.orderer();

        let (detection, ordered) = tokio::task::spawn_blocking(
            move || -> CoordinatorResult<(Detection, OrderedPlan)> {
                let detection = detector.detect(&candidates, &table)?;
                let ordered = orderer.plan(
                    &detection.changes,
                    &graph,
                    |source| {
                        detection
                            .fingerprints
                            .get(source)
                            .cloned()
                            .or_else(|| fingerprint_file(&detector.path_of(source)).ok())
                    },
                    &exclusions,
                );
                Ok((detection, ordered))
            },
        )
        .await??;

        self.store.clear_build_output().await?;
        self.store.save_change_set(&detection.changes).await?;
        self.store.save_plan(&ordered.plan).await?;
        Ok(ordered)
    }

    async fn prepare_retry(
        &self,
        previous: BuildPlan,
        exclusions: Exclusions,
    ) -> CoordinatorResult<OrderedPlan> {
        let graph = self.store.load_dependencies().await?;
        let detector = self.detector();
        let orderer = self.orderer();

        let ordered = tokio::task::spawn_blocking(move || {
            orderer.replan(
                &previous,
                &graph,
                |source| fingerprint_file(&detector.path_of(source)).ok(),
                &exclusions,
            )
        })
        .await?;

        self.store.clear_build_output().await?;
        self.store.save_plan(&ordered.plan).await?;
        Ok(ordered)
    }

    /// Shell command running one action of the remote build tool
    fn tool_command(
        &self,
        remote: &RemoteTarget<'_>,
        action: &str,
        source: Option<&str>,
        clear_logs: bool,
    ) -> String {
        let mut command = format!("cd {} || exit 1; ", shell_quote(remote.base_dir));
        if clear_logs {
            let output = self.config.paths.build_output.display().to_string();
            let logs = self.config.paths.log_dir.display().to_string();
            command.push_str(&format!(
                "rm -rf {}/* {}/* 2> /dev/null || true; ",
                shell_quote(&output),
                shell_quote(&logs)
            ));
        }
        command.push_str(&format!(
            "{} {}/main.py -a {} -p .",
            remote.interpreter,
            shell_quote(remote.tool_dir.trim_end_matches('/')),
            action
        ));
        if let Some(source) = source {
            command.push_str(&format!(" --source={}", shell_quote(source)));
        }
        command
    }

    async fn check_host_ready(&self, remote: &RemoteTarget<'_>) -> CoordinatorResult<()> {
        let command = format!(
            "test -d {} && test -f {}/main.py && command -v {} > /dev/null",
            shell_quote(remote.base_dir),
            shell_quote(remote.tool_dir.trim_end_matches('/')),
            remote.interpreter
        );
        let output = self.transport.execute_remote_command(&command).await?;
        if !output.success() {
            return Err(CoordinatorError::Configuration(format!(
                "build host is not prepared: {} or {}/main.py or {} is missing",
                remote.base_dir, remote.tool_dir, remote.interpreter
            )));
        }
        Ok(())
    }

    async fn run_checked(&self, command: &str) -> CoordinatorResult<RemoteOutput> {
        let output = self.transport.execute_remote_command(command).await?;
        if !output.success() {
            return Err(TransportError::CommandFailed {
                program: command.to_string(),
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    async fn retrieve_results(&self) -> CoordinatorResult<()> {
        let paths = &self.config.paths;
        let output_dir = self.store.build_output_dir();
        let temp_dir = self.store.temp_dir();
        let log_dir = self.store.log_dir();
        let remote_output = remote_path(&paths.build_output)?;
        let remote_temp = remote_path(&paths.temp_dir)?;
        let remote_logs = remote_path(&paths.log_dir)?;

        tokio::try_join!(
            self.transport.get_remote_dir(&output_dir, &remote_output),
            self.transport.get_remote_dir(&temp_dir, &remote_temp),
            self.transport.get_remote_dir(&log_dir, &remote_logs),
        )?;
        debug!("Retrieved build output, temp and log directories");
        Ok(())
    }

    /// Apply the remote report to the fingerprint table.
    ///
    /// Only successful sources are updated. Returns the new table and the
    /// succeeded and failed sources.
    async fn apply_report(
        &self,
        plan: &BuildPlan,
        report: &BuildReport,
    ) -> CoordinatorResult<(FingerprintTable, Vec<String>, Vec<String>)> {
        let mut table = self.store.load_table().await?;
        let detector = self.detector();

        let mut succeeded = Vec::new();
        for entry in &report.entries {
            if entry.status != BuildStatus::Success {
                continue;
            }
            let planned = plan.target(&entry.source).and_then(|t| t.fingerprint.clone());
            let fingerprint = match entry.hash.clone().or(planned) {
                Some(fingerprint) => fingerprint,
                None => match fresh_fingerprint(&detector.path_of(&entry.source)).await {
                    Some(fingerprint) => fingerprint,
                    None => {
                        warn!("Cannot fingerprint {}, table entry not updated", entry.source);
                        continue;
                    }
                },
            };
            let _ = table.insert(entry.source.clone(), fingerprint);
            succeeded.push(entry.source.clone());
        }

        let failed = report.with_status(BuildStatus::Failure);
        for source in &failed {
            debug!("Remote build of {} failed", source);
        }
        Ok((table, succeeded, failed))
    }
}

async fn fresh_fingerprint(path: &Path) -> Option<String> {
    let path = path.to_path_buf();
    match tokio::task::spawn_blocking(move || fingerprint_file(&path)).await {
        Ok(Ok(fingerprint)) => Some(fingerprint),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fernbau_remote::LocalTransport;

    fn coordinator(config: FernbauConfig) -> BuildCoordinator {
        let transport = Arc::new(LocalTransport::new("/work", "/remote"));
        BuildCoordinator::new("/work", config, transport)
    }

    fn remote_config() -> FernbauConfig {
        let mut config = FernbauConfig::default();
        config.remote.base_dir = Some("/home/ci/project".into());
        config.remote.tool_dir = Some("/opt/tool/".into());
        config
    }

    #[test]
    fn test_run_command_clears_logs() {
        let config = remote_config();
        let coordinator = coordinator(config.clone());
        let remote = config.validate_remote().unwrap();

        let command = coordinator.tool_command(&remote, "run", None, true);
        assert_eq!(
            command,
            "cd '/home/ci/project' || exit 1; \
             rm -rf '.fernbau/build-output'/* '.fernbau/log'/* 2> /dev/null || true; \
             python3 '/opt/tool'/main.py -a run -p ."
        );
    }

    #[test]
    fn test_generate_command_passes_single_source() {
        let config = remote_config();
        let coordinator = coordinator(config.clone());
        let remote = config.validate_remote().unwrap();

        let command = coordinator.tool_command(&remote, "create", Some("src/a b.c"), false);
        assert!(command.starts_with("cd '/home/ci/project' || exit 1; python3"));
        assert!(command.ends_with("-a create -p . --source='src/a b.c'"));
    }

    #[test]
    fn test_partial_failure_outcome() {
        let outcome = BuildOutcome::Completed {
            succeeded: vec!["a.c".into()],
            failed: vec!["b.c".into()],
            snapshot: PathBuf::from("h"),
        };
        assert!(outcome.is_partial_failure());
        assert!(!BuildOutcome::NothingToBuild.is_partial_failure());
    }
}
