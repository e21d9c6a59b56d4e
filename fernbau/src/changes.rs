//! Content fingerprints and change detection
//!
//! A source is identified by its path relative to the source root, with
//! forward slashes. Its fingerprint is the lowercase hex SHA-256 of the file
//! content. Comparing fingerprints against the table of the last successful
//! builds partitions the candidates into new, changed and unchanged sources.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Source path -> fingerprint of its last successful build
pub type FingerprintTable = BTreeMap<String, String>;

/// Fingerprint raw bytes
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint a file
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(fingerprint_bytes(&content))
}

/// Lowercased file extension of a source, if any
pub fn object_type(source: &str) -> Option<String> {
    let name = source.rsplit('/').next().unwrap_or(source);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}

/// Normalize a user supplied source path to its table key.
///
/// `./` and empty components are dropped and backslashes read as
/// separators. Returns `None` for absolute paths and paths with `..`.
pub fn normalize_source(source: &str) -> Option<String> {
    let unified = source.replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Sources that need a build compared to the fingerprint table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangeSet {
    /// Sources without a table entry, in discovery order
    pub new_objects: Vec<String>,

    /// Sources whose fingerprint differs from the table, in discovery order
    pub changed_sources: Vec<String>,

    /// Table entries whose file no longer exists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale_objects: Vec<String>,
}

impl ChangeSet {
    /// Whether there is nothing to build
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.changed_sources.is_empty()
    }

    /// Number of sources that need a build
    pub fn len(&self) -> usize {
        self.new_objects.len() + self.changed_sources.len()
    }

    /// New objects followed by changed sources
    pub fn sources(&self) -> impl Iterator<Item = &String> {
        self.new_objects.iter().chain(self.changed_sources.iter())
    }
}

/// Which sources to examine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// Every supported source below the root
    WholeTree,
    /// Only the given sources
    Explicit(Vec<String>),
}

/// Result of a detection run
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub changes: ChangeSet,

    /// Current fingerprint of every examined source
    pub fingerprints: BTreeMap<String, String>,
}

/// Change detector over one source root
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    root: PathBuf,
    supported: HashSet<String>,
}

impl ChangeDetector {
    pub fn new(root: impl Into<PathBuf>, supported: &[String]) -> Self {
        Self {
            root: root.into(),
            supported: supported.iter().cloned().collect(),
        }
    }

    /// Absolute location of a source
    pub fn path_of(&self, source: &str) -> PathBuf {
        self.root.join(source)
    }

    pub fn is_supported(&self, source: &str) -> bool {
        object_type(source).is_some_and(|t| self.supported.contains(&t))
    }

    /// Every supported source below the root in lexicographic order.
    ///
    /// Hidden directories (such as `.fernbau` and `.git`) are skipped.
    pub fn discover(&self) -> CoordinatorResult<Vec<String>> {
        let mut sources = Vec::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && is_hidden(e.file_name())));

        for entry in walker {
            let entry = entry.map_err(|e| CoordinatorError::SourceRead {
                path: e.path().map_or_else(|| self.root.clone(), Path::to_path_buf),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(source) = relative_source(&self.root, entry.path()) else {
                continue;
            };
            if self.is_supported(&source) {
                sources.push(source);
            }
        }

        sources.sort();
        debug!("Discovered {} sources below {}", sources.len(), self.root.display());
        Ok(sources)
    }

    /// Partition the candidates against `table`.
    ///
    /// All-or-nothing: the first unreadable candidate aborts detection.
    pub fn detect(
        &self,
        candidates: &Candidates,
        table: &FingerprintTable,
    ) -> CoordinatorResult<Detection> {
        let sources = match candidates {
            Candidates::WholeTree => self.discover()?,
            Candidates::Explicit(list) => {
                let mut sources = Vec::with_capacity(list.len());
                for candidate in list {
                    let source = normalize_source(candidate)
                        .ok_or_else(|| CoordinatorError::InvalidSource(candidate.clone()))?;
                    if !self.is_supported(&source) {
                        return Err(CoordinatorError::UnsupportedObjectType(source));
                    }
                    sources.push(source);
                }
                sources
            }
        };

        let mut detection = Detection::default();
        for source in sources {
            if detection.fingerprints.contains_key(&source) {
                continue;
            }
            let path = self.path_of(&source);
            let fingerprint = fingerprint_file(&path)
                .map_err(|e| CoordinatorError::SourceRead { path, source: e })?;

            match table.get(&source) {
                None => detection.changes.new_objects.push(source.clone()),
                Some(known) if *known != fingerprint => {
                    detection.changes.changed_sources.push(source.clone());
                }
                Some(_) => {}
            }
            let _ = detection.fingerprints.insert(source, fingerprint);
        }

        detection.changes.stale_objects = self.stale_entries(table);
        if !detection.changes.stale_objects.is_empty() {
            warn!(
                "{} fingerprint entries refer to missing files",
                detection.changes.stale_objects.len()
            );
        }

        Ok(detection)
    }

    /// Table entries whose file is gone
    pub fn stale_entries(&self, table: &FingerprintTable) -> Vec<String> {
        table
            .keys()
            .filter(|source| !self.path_of(source).is_file())
            .cloned()
            .collect()
    }

    /// Fingerprint every supported source currently on disk
    pub fn fingerprint_all(&self) -> CoordinatorResult<FingerprintTable> {
        self.discover()?
            .into_iter()
            .map(|source| {
                let path = self.path_of(&source);
                fingerprint_file(&path)
                    .map(|fp| (source, fp))
                    .map_err(|e| CoordinatorError::SourceRead { path, source: e })
            })
            .collect()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.') && n != "." && n != "..")
}

fn relative_source(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supported() -> Vec<String> {
        vec!["c".to_string(), "h".to_string()]
    }

    fn write(dir: &Path, source: &str, content: &str) {
        let path = dir.join(source);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_object_type() {
        assert_eq!(object_type("src/main.C"), Some("c".to_string()));
        assert_eq!(object_type("lib/v1.2/readme"), None);
        assert_eq!(object_type(".hidden"), None);
        assert_eq!(object_type("a.tar.gz"), Some("gz".to_string()));
    }

    #[test]
    fn test_discover_is_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "zeta.c", "z");
        write(dir.path(), "alpha/b.h", "b");
        write(dir.path(), "alpha/a.c", "a");
        write(dir.path(), "notes.txt", "n");
        write(dir.path(), ".fernbau/tmp/x.c", "x");

        let detector = ChangeDetector::new(dir.path(), &supported());
        assert_eq!(
            detector.discover().unwrap(),
            vec!["alpha/a.c", "alpha/b.h", "zeta.c"]
        );
    }

    #[test]
    fn test_first_build_everything_is_new() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.c", "int a;");
        write(dir.path(), "b.c", "int b;");

        let detector = ChangeDetector::new(dir.path(), &supported());
        let detection = detector
            .detect(&Candidates::WholeTree, &FingerprintTable::new())
            .unwrap();

        assert_eq!(detection.changes.new_objects, vec!["a.c", "b.c"]);
        assert!(detection.changes.changed_sources.is_empty());
        assert_eq!(detection.fingerprints.len(), 2);
    }

    #[test]
    fn test_partition_new_changed_unchanged() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.c", "int a;");
        write(dir.path(), "b.c", "int b = 2;");
        write(dir.path(), "c.c", "int c;");

        let mut table = FingerprintTable::new();
        let _ = table.insert("a.c".into(), fingerprint_bytes(b"int a;"));
        let _ = table.insert("b.c".into(), fingerprint_bytes(b"int b;"));

        let detector = ChangeDetector::new(dir.path(), &supported());
        let changes = detector
            .detect(&Candidates::WholeTree, &table)
            .unwrap()
            .changes;

        assert_eq!(changes.new_objects, vec!["c.c"]);
        assert_eq!(changes.changed_sources, vec!["b.c"]);
        let new: HashSet<_> = changes.new_objects.iter().collect();
        assert!(changes.changed_sources.iter().all(|s| !new.contains(s)));
    }

    #[test]
    fn test_stale_entries_are_reported_not_removed() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.c", "int a;");

        let mut table = FingerprintTable::new();
        let _ = table.insert("a.c".into(), fingerprint_bytes(b"int a;"));
        let _ = table.insert("gone.c".into(), "00".into());

        let detector = ChangeDetector::new(dir.path(), &supported());
        let changes = detector.detect(&Candidates::WholeTree, &table).unwrap().changes;

        assert!(changes.is_empty());
        assert_eq!(changes.stale_objects, vec!["gone.c"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_explicit_candidates() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.c", "int a;");
        write(dir.path(), "b.c", "int b;");

        let detector = ChangeDetector::new(dir.path(), &supported());
        let changes = detector
            .detect(
                &Candidates::Explicit(vec!["b.c".into()]),
                &FingerprintTable::new(),
            )
            .unwrap()
            .changes;
        assert_eq!(changes.new_objects, vec!["b.c"]);
    }

    #[test]
    fn test_explicit_candidates_are_normalized() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "lib/a.c", "int a;");

        let mut table = FingerprintTable::new();
        let _ = table.insert("lib/a.c".into(), fingerprint_bytes(b"int a;"));

        let detector = ChangeDetector::new(dir.path(), &supported());
        let detection = detector
            .detect(
                &Candidates::Explicit(vec!["./lib/a.c".into(), "lib//a.c".into()]),
                &table,
            )
            .unwrap();
        assert!(detection.changes.is_empty());
        assert_eq!(detection.fingerprints.keys().collect::<Vec<_>>(), vec!["lib/a.c"]);
    }

    #[test]
    fn test_escaping_candidates_are_rejected() {
        let dir = TempDir::new().unwrap();
        let detector = ChangeDetector::new(dir.path().join("src"), &supported());
        write(dir.path(), "x.c", "int x;");

        for candidate in ["../x.c", "/etc/x.c", "lib/../../x.c", "."] {
            let err = detector
                .detect(
                    &Candidates::Explicit(vec![candidate.into()]),
                    &FingerprintTable::new(),
                )
                .unwrap_err();
            assert!(
                matches!(err, CoordinatorError::InvalidSource(_)),
                "{candidate} was accepted"
            );
        }
        assert_eq!(normalize_source(r"lib\a.c").as_deref(), Some("lib/a.c"));
    }

    #[test]
    fn test_missing_candidate_aborts() {
        let dir = TempDir::new().unwrap();
        let detector = ChangeDetector::new(dir.path(), &supported());
        let err = detector
            .detect(
                &Candidates::Explicit(vec!["missing.c".into()]),
                &FingerprintTable::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SourceRead { .. }));
    }

    #[test]
    fn test_unsupported_candidate_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "notes.txt", "n");
        let detector = ChangeDetector::new(dir.path(), &supported());
        let err = detector
            .detect(
                &Candidates::Explicit(vec!["notes.txt".into()]),
                &FingerprintTable::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnsupportedObjectType(_)));
    }

    #[test]
    fn test_change_set_json_shape() {
        let changes = ChangeSet {
            new_objects: vec!["c.c".into()],
            changed_sources: vec!["b.c".into()],
            stale_objects: vec![],
        };
        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"new-objects": ["c.c"], "changed-sources": ["b.c"]})
        );
    }
}
