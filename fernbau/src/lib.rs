//! Fernbau - incremental builds on a remote build host
//!
//! Fernbau keeps a table of content fingerprints of every source that was
//! built successfully. From it, each build cycle derives the sources that
//! changed, expands them through the declared dependency list to everything
//! affected, orders the result and drives the remote build host through a
//! [`Transport`](fernbau_remote::Transport).
//!
//! # Modules
//!
//! - [`changes`]: fingerprints and change detection
//! - [`orderer`]: closure expansion and build ordering policy
//! - [`plan`]: build plan and remote report documents
//! - [`store`]: JSON persistence
//! - [`history`]: archive of completed cycles
//! - [`status`]: per-operation mutual exclusion
//! - [`coordinator`]: the build cycle
//! - [`dispatch`]: request/response boundary for front ends

pub mod changes;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod orderer;
pub mod plan;
pub mod status;
pub mod store;

pub use changes::{ChangeDetector, ChangeSet, FingerprintTable};
pub use config::FernbauConfig;
pub use coordinator::{BuildCoordinator, BuildOutcome, DependencyEdit, DependencyUpdate};
pub use dispatch::{Request, Response, dispatch};
pub use error::{CoordinatorError, CoordinatorResult};
pub use status::{OperationKind, RunState};
