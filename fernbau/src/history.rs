//! Archive of completed build cycles
//!
//! Every completed cycle leaves one snapshot directory below the history
//! directory, named after the plan timestamp. A snapshot holds the plan and a
//! copy of the temp payload that came back from the build host. Snapshots
//! are never overwritten.

use std::path::{Path, PathBuf};

use fernbau_remote::copy_tree;
use tracing::{debug, info};

use crate::error::CoordinatorResult;
use crate::plan::BuildPlan;
use crate::store::write_json;

/// File name of the plan inside a snapshot
pub const PLAN_FILE: &str = "build-plan.json";

/// Turn a timestamp into a directory name valid on common filesystems
pub fn sanitize_timestamp(timestamp: &str) -> String {
    timestamp
        .chars()
        .map(|c| match c {
            ':' => '.',
            ' ' => '_',
            '<' | '>' | '"' | '/' | '\\' | '|' | '?' | '*' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct HistoryArchiver {
    dir: PathBuf,
}

impl HistoryArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store `plan` and a copy of `payload` as a new snapshot.
    ///
    /// Returns the snapshot directory.
    pub async fn archive(&self, plan: &BuildPlan, payload: &Path) -> CoordinatorResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let snapshot = self.claim(&sanitize_timestamp(&plan.timestamp)).await?;

        write_json(&snapshot.join(PLAN_FILE), plan).await?;
        if tokio::fs::try_exists(payload).await? {
            let from = payload.to_path_buf();
            let to = snapshot.join(payload.file_name().unwrap_or_default());
            let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to)).await??;
            debug!("Archived {} payload files", copied);
        }

        info!("Archived build in {}", snapshot.display());
        Ok(snapshot)
    }

    /// Create a fresh snapshot directory, appending `-1`, `-2`, ... on
    /// collision.
    async fn claim(&self, name: &str) -> CoordinatorResult<PathBuf> {
        let mut suffix = 0usize;
        loop {
            let candidate = if suffix == 0 {
                self.dir.join(name)
            } else {
                self.dir.join(format!("{name}-{suffix}"))
            };
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Snapshot names sorted ascending
    pub async fn list(&self) -> CoordinatorResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BuildTarget;
    use tempfile::TempDir;

    fn plan(timestamp: &str) -> BuildPlan {
        BuildPlan {
            timestamp: timestamp.to_string(),
            targets: vec![BuildTarget {
                source: "a.c".into(),
                object_type: "c".into(),
                fingerprint: None,
                command: None,
                status: None,
            }],
        }
    }

    #[test]
    fn test_sanitize_timestamp() {
        assert_eq!(sanitize_timestamp("2024-05-01 12:30:00"), "2024-05-01_12.30.00");
        assert_eq!(sanitize_timestamp("a<b>c|d?e*f\"g/h\\i"), "a-b-c-d-e-f-g-h-i");
    }

    #[tokio::test]
    async fn test_archive_copies_plan_and_payload() {
        let dir = TempDir::new().unwrap();
        let payload = dir.path().join("tmp");
        tokio::fs::create_dir_all(payload.join("sub")).await.unwrap();
        tokio::fs::write(payload.join("sub/out.txt"), "ok").await.unwrap();

        let archiver = HistoryArchiver::new(dir.path().join("history"));
        let snapshot = archiver
            .archive(&plan("2024-05-01 12:30:00"), &payload)
            .await
            .unwrap();

        assert!(snapshot.ends_with("2024-05-01_12.30.00"));
        assert!(snapshot.join(PLAN_FILE).exists());
        assert!(snapshot.join("tmp/sub/out.txt").exists());
    }

    #[tokio::test]
    async fn test_colliding_snapshots_get_suffixes() {
        let dir = TempDir::new().unwrap();
        let archiver = HistoryArchiver::new(dir.path().join("history"));
        let missing = dir.path().join("no-payload");

        let first = archiver.archive(&plan("2024-05-01 12:30:00"), &missing).await.unwrap();
        let second = archiver.archive(&plan("2024-05-01 12:30:00"), &missing).await.unwrap();
        let third = archiver.archive(&plan("2024-05-01 12:30:00"), &missing).await.unwrap();

        assert_ne!(first, second);
        assert!(second.ends_with("2024-05-01_12.30.00-1"));
        assert!(third.ends_with("2024-05-01_12.30.00-2"));
        assert_eq!(
            archiver.list().await.unwrap(),
            vec![
                "2024-05-01_12.30.00",
                "2024-05-01_12.30.00-1",
                "2024-05-01_12.30.00-2"
            ]
        );
    }

    #[tokio::test]
    async fn test_list_without_history() {
        let dir = TempDir::new().unwrap();
        let archiver = HistoryArchiver::new(dir.path().join("history"));
        assert!(archiver.list().await.unwrap().is_empty());
    }
}
