//! Build plan and remote build report documents

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Timestamp format of build plans, also used to name history snapshots
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One source to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildTarget {
    pub source: String,
    pub object_type: String,
    /// Fingerprint of the content that was planned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Command override for this source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Outcome of the last remote build of this plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BuildStatus>,
}

/// Ordered list of targets for one build cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub timestamp: String,
    pub targets: Vec<BuildTarget>,
}

impl BuildPlan {
    pub fn new(targets: Vec<BuildTarget>) -> Self {
        Self {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            targets,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.source.as_str())
    }

    pub fn target(&self, source: &str) -> Option<&BuildTarget> {
        self.targets.iter().find(|t| t.source == source)
    }

    /// Record the per-source outcome of `report` on the targets.
    pub fn record(&mut self, report: &BuildReport) {
        for target in &mut self.targets {
            target.status = report
                .entries
                .iter()
                .rev()
                .find(|e| e.source == target.source)
                .map(|e| e.status);
        }
    }

    /// Targets the last remote build did not complete, in plan order
    pub fn unfinished(&self) -> impl Iterator<Item = &BuildTarget> {
        self.targets
            .iter()
            .filter(|t| t.status != Some(BuildStatus::Success))
    }
}

/// Per-source result reported by the remote build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failure,
    /// Not built yet; unknown values are read as pending
    #[serde(other)]
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub source: String,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Report written by the remote build tool into the build output directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildReport {
    pub entries: Vec<ReportEntry>,
}

impl BuildReport {
    /// Sources with the given status, in report order
    pub fn with_status(&self, status: BuildStatus) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.source.clone())
            .collect()
    }
}
