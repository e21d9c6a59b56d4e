//! Per-operation run status cells
//!
//! Each kind of coordinator operation has one cell that is either `Ready` or
//! `InProcess`. Entering an operation flips its cell with a compare-and-set;
//! the returned [`RunPermit`] flips it back when dropped, so every exit path
//! (including `?` and panics unwinding) releases the cell.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Kinds of operations guarded by a status cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Build,
    Preview,
    RemoteSourceList,
    ObjectListReset,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Build,
        OperationKind::Preview,
        OperationKind::RemoteSourceList,
        OperationKind::ObjectListReset,
    ];

    fn index(self) -> usize {
        match self {
            OperationKind::Build => 0,
            OperationKind::Preview => 1,
            OperationKind::RemoteSourceList => 2,
            OperationKind::ObjectListReset => 3,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Build => "Build",
            OperationKind::Preview => "Change preview",
            OperationKind::RemoteSourceList => "Remote source list refresh",
            OperationKind::ObjectListReset => "Object list reset",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Ready,
    InProcess,
}

/// The four status cells
#[derive(Debug, Default)]
pub struct RunStatusRegistry {
    cells: [AtomicBool; 4],
}

impl RunStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the cell of `kind` from `Ready` to `InProcess`.
    ///
    /// Fails with `AlreadyRunning` without touching anything when the cell
    /// is not `Ready`.
    pub fn try_acquire(&self, kind: OperationKind) -> CoordinatorResult<RunPermit<'_>> {
        let cell = &self.cells[kind.index()];
        cell.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CoordinatorError::AlreadyRunning(kind))?;
        Ok(RunPermit { cell, kind })
    }

    pub fn state(&self, kind: OperationKind) -> RunState {
        if self.cells[kind.index()].load(Ordering::Acquire) {
            RunState::InProcess
        } else {
            RunState::Ready
        }
    }
}

/// Scoped permission to run one operation kind
#[derive(Debug)]
pub struct RunPermit<'a> {
    cell: &'a AtomicBool,
    kind: OperationKind,
}

impl RunPermit<'_> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.cell.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let registry = RunStatusRegistry::new();
        for kind in OperationKind::ALL {
            assert_eq!(registry.state(kind), RunState::Ready);
        }

        {
            let permit = registry.try_acquire(OperationKind::Build).unwrap();
            assert_eq!(permit.kind(), OperationKind::Build);
            assert_eq!(registry.state(OperationKind::Build), RunState::InProcess);
        }

        assert_eq!(registry.state(OperationKind::Build), RunState::Ready);
    }

    #[test]
    fn test_same_kind_is_rejected() {
        let registry = RunStatusRegistry::new();
        let _permit = registry.try_acquire(OperationKind::Preview).unwrap();

        let err = registry.try_acquire(OperationKind::Preview).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::AlreadyRunning(OperationKind::Preview)
        ));
        // Rejection leaves the holder in place
        assert_eq!(registry.state(OperationKind::Preview), RunState::InProcess);
    }

    #[test]
    fn test_different_kinds_are_independent() {
        let registry = RunStatusRegistry::new();
        let _build = registry.try_acquire(OperationKind::Build).unwrap();
        let _reset = registry.try_acquire(OperationKind::ObjectListReset).unwrap();
        assert_eq!(registry.state(OperationKind::RemoteSourceList), RunState::Ready);
    }

    #[test]
    fn test_release_on_error_path() {
        fn failing(registry: &RunStatusRegistry) -> CoordinatorResult<()> {
            let _permit = registry.try_acquire(OperationKind::Build)?;
            Err(CoordinatorError::Configuration("boom".into()))
        }

        let registry = RunStatusRegistry::new();
        assert!(failing(&registry).is_err());
        assert_eq!(registry.state(OperationKind::Build), RunState::Ready);
    }
}
