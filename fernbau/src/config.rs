//! Workspace configuration loaded from `.fernbau/config.yml`
//!
//! Every key is optional. A workspace without a configuration file gets the
//! defaults below, which is enough for change detection; remote builds need
//! at least `remote.host`, `remote.base-dir` and `remote.tool-dir`.
//!
//! ```yaml
//! source-dir: src
//! supported-object-types: [c, h, sql]
//! object-type-precedence: [sql, h]
//! plan-policy: generate
//! source-commands:
//!   db/orders.sql: "RUNSQL FILE(orders.sql)"
//! remote:
//!   host: build01
//!   user: ci
//!   base-dir: /home/ci/project
//!   tool-dir: /opt/buildtool
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Location of the configuration file inside a workspace
pub const CONFIG_FILE: &str = ".fernbau/config.yml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

/// How the remote side obtains its build plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanPolicy {
    /// Send the locally computed plan along with the temp directory
    #[default]
    Transfer,
    /// Let the remote build tool generate its own build script
    Generate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FernbauConfig {
    /// Source root, relative to the workspace
    pub source_dir: PathBuf,

    /// Recognized object types (lowercase file extensions)
    pub supported_object_types: Vec<String>,

    /// Object types that are built first when nothing else decides the order
    pub object_type_precedence: Vec<String>,

    /// Per-source build command overrides
    pub source_commands: BTreeMap<String, String>,

    pub plan_policy: PlanPolicy,

    pub paths: PathsConfig,

    pub remote: RemoteConfig,
}

impl Default for FernbauConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            supported_object_types: ["c", "cc", "cpp", "h", "hpp", "sql"]
                .map(String::from)
                .to_vec(),
            object_type_precedence: ["sql", "h", "hpp"].map(String::from).to_vec(),
            source_commands: BTreeMap::new(),
            plan_policy: PlanPolicy::default(),
            paths: PathsConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Local file locations, relative to the workspace.
///
/// The same relative locations are used on the remote host below
/// `remote.base-dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PathsConfig {
    pub fingerprint_table: PathBuf,
    pub dependency_list: PathBuf,
    pub change_set: PathBuf,
    pub build_plan: PathBuf,
    pub temp_dir: PathBuf,
    pub build_output: PathBuf,
    /// File name of the per-source report inside `build-output`
    pub build_report: String,
    pub log_dir: PathBuf,
    pub history_dir: PathBuf,
    pub remote_source_list: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            fingerprint_table: PathBuf::from(".fernbau/etc/object-builds.json"),
            dependency_list: PathBuf::from(".fernbau/etc/dependency.json"),
            change_set: PathBuf::from(".fernbau/tmp/changed-object-list.json"),
            build_plan: PathBuf::from(".fernbau/tmp/build-plan.json"),
            temp_dir: PathBuf::from(".fernbau/tmp"),
            build_output: PathBuf::from(".fernbau/build-output"),
            build_report: "build-report.json".to_string(),
            log_dir: PathBuf::from(".fernbau/log"),
            history_dir: PathBuf::from(".fernbau/build-history"),
            remote_source_list: PathBuf::from(".fernbau/etc/source-list-remote.json"),
        }
    }
}

/// Remote build host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RemoteConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Project directory on the build host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<String>,
    /// Directory of the remote build tool (contains `main.py`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_dir: Option<String>,
    /// Interpreter used to run the remote build tool
    pub interpreter: String,
    /// Source list written by the remote tool, relative to `base-dir`
    pub source_list: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: None,
            base_dir: None,
            tool_dir: None,
            interpreter: "python3".to_string(),
            source_list: ".fernbau/etc/source-list.json".to_string(),
        }
    }
}

/// Remote settings after validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget<'a> {
    pub base_dir: &'a str,
    pub tool_dir: &'a str,
    pub interpreter: &'a str,
}

impl FernbauConfig {
    /// Load the configuration of a workspace, falling back to defaults when
    /// the file does not exist.
    pub async fn load(workspace: &Path) -> Result<Self, ConfigError> {
        let path = workspace.join(CONFIG_FILE);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ConfigError::Io(path.clone(), e))?
        {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigError::Io(path.clone(), e))?;
        Self::from_yaml(&content).map_err(|e| ConfigError::Parse(path, e))
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        for list in [
            &mut self.supported_object_types,
            &mut self.object_type_precedence,
        ] {
            for object_type in list.iter_mut() {
                *object_type = object_type.trim_start_matches('.').to_lowercase();
            }
        }
    }

    /// Check the remote settings needed before any remote step.
    pub fn validate_remote(&self) -> CoordinatorResult<RemoteTarget<'_>> {
        let base_dir = non_empty(self.remote.base_dir.as_deref())
            .ok_or_else(|| CoordinatorError::Configuration("remote.base-dir is not set".into()))?;
        let tool_dir = non_empty(self.remote.tool_dir.as_deref())
            .ok_or_else(|| CoordinatorError::Configuration("remote.tool-dir is not set".into()))?;
        let interpreter = non_empty(Some(self.remote.interpreter.as_str())).ok_or_else(|| {
            CoordinatorError::Configuration("remote.interpreter is empty".into())
        })?;

        Ok(RemoteTarget {
            base_dir,
            tool_dir,
            interpreter,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FernbauConfig::from_yaml("{}").unwrap();
        assert_eq!(config, FernbauConfig::default());
        assert_eq!(config.plan_policy, PlanPolicy::Transfer);
        assert_eq!(
            config.paths.fingerprint_table,
            PathBuf::from(".fernbau/etc/object-builds.json")
        );
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
source-dir: src
supported-object-types: [".C", sql]
object-type-precedence: [SQL]
plan-policy: generate
source-commands:
  db/orders.sql: "run orders"
remote:
  host: build01
  port: 2222
  base-dir: /home/ci/project
  tool-dir: /opt/tool
"#;
        let config = FernbauConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.source_dir, PathBuf::from("src"));
        assert_eq!(config.supported_object_types, vec!["c", "sql"]);
        assert_eq!(config.object_type_precedence, vec!["sql"]);
        assert_eq!(config.plan_policy, PlanPolicy::Generate);
        assert_eq!(config.source_commands["db/orders.sql"], "run orders");
        assert_eq!(config.remote.port, Some(2222));
        assert_eq!(config.remote.interpreter, "python3");

        let target = config.validate_remote().unwrap();
        assert_eq!(target.base_dir, "/home/ci/project");
        assert_eq!(target.tool_dir, "/opt/tool");
    }

    #[test]
    fn test_validate_remote_requires_directories() {
        let mut config = FernbauConfig::default();
        assert!(matches!(
            config.validate_remote(),
            Err(CoordinatorError::Configuration(_))
        ));

        config.remote.base_dir = Some("/srv/build".into());
        config.remote.tool_dir = Some("  ".into());
        assert!(matches!(
            config.validate_remote(),
            Err(CoordinatorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = FernbauConfig::load(dir.path()).await.unwrap();
        assert_eq!(config, FernbauConfig::default());
    }

    #[tokio::test]
    async fn test_load_reports_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".fernbau")).await.unwrap();
        tokio::fs::write(dir.path().join(CONFIG_FILE), "plan-policy: [")
            .await
            .unwrap();
        let err = FernbauConfig::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_, _)));
    }
}
