//! Fernbau command-line interface

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::coordinator::DependencyEdit;
use crate::dispatch::Request;

/// Fernbau - incremental builds on a remote build host
#[derive(Parser)]
#[command(name = "fernbau")]
#[command(about = "Plan and run incremental builds on a remote build host")]
#[command(version)]
pub struct Cli {
    /// Workspace directory (contains .fernbau/)
    #[arg(short, long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// Use a local directory as build host instead of ssh
    #[arg(long, global = true, value_name = "DIR")]
    pub local_remote: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show sources changed since their last successful build
    Changes {
        /// Only examine this source
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Build changed sources and everything that depends on them
    Build {
        /// Sources to examine (default: whole tree)
        sources: Vec<String>,
    },

    /// Build again, leaving out sources or command overrides
    Rerun {
        /// Source to leave out (repeatable)
        #[arg(long = "ignore-source", value_name = "SOURCE")]
        ignore_sources: Vec<String>,

        /// Command override to leave out, as SOURCE=COMMAND (repeatable)
        #[arg(long = "ignore-command", value_name = "SOURCE=COMMAND", value_parser = parse_source_command)]
        ignore_commands: Vec<(String, String)>,
    },

    /// Record every source on disk as built, without building
    ResetObjects,

    /// Replace the fingerprint table with the one on the build host
    RemoteObjects,

    /// Fetch the source list of the build host
    RemoteSources,

    /// Report local sources that are missing on the build host
    CheckRemote,

    /// Send every source to the build host without building
    TransferAll,

    /// Inspect or edit the dependency list
    Deps {
        #[command(subcommand)]
        operation: DepsOperation,
    },

    /// List archived builds
    History,
}

#[derive(Subcommand)]
pub enum DepsOperation {
    /// Show direct dependencies and dependents of a source
    Show { source: String },

    /// SOURCE depends on DEPENDENCY
    Add { source: String, dependency: String },

    /// SOURCE is a dependency of DEPENDENT
    AddDependent { source: String, dependent: String },

    /// Remove "SOURCE depends on DEPENDENCY"
    Remove { source: String, dependency: String },

    /// Remove "DEPENDENT depends on SOURCE"
    RemoveDependent { source: String, dependent: String },
}

fn parse_source_command(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((source, command)) if !source.is_empty() && !command.is_empty() => {
            Ok((source.to_string(), command.to_string()))
        }
        _ => Err(format!("expected SOURCE=COMMAND, got '{value}'")),
    }
}

impl From<Commands> for Request {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Changes { source } => Request::PreviewChanges { source },
            Commands::Build { sources } => Request::RunBuild { sources },
            Commands::Rerun {
                ignore_sources,
                ignore_commands,
            } => {
                let mut commands: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for (source, command) in ignore_commands {
                    commands.entry(source).or_default().push(command);
                }
                Request::RerunBuild {
                    ignore_sources,
                    ignore_commands: commands,
                }
            }
            Commands::ResetObjects => Request::ResetObjectList,
            Commands::RemoteObjects => Request::FetchCompiledObjectList,
            Commands::RemoteSources => Request::RefreshRemoteSourceList,
            Commands::CheckRemote => Request::CheckRemoteSources,
            Commands::TransferAll => Request::TransferAll,
            Commands::Deps { operation } => match operation {
                DepsOperation::Show { source } => Request::ShowDependencies { source },
                DepsOperation::Add { source, dependency } => {
                    Request::EditDependencies(DependencyEdit::Add { source, dependency })
                }
                DepsOperation::AddDependent { source, dependent } => {
                    Request::EditDependencies(DependencyEdit::AddDependent { source, dependent })
                }
                DepsOperation::Remove { source, dependency } => {
                    Request::EditDependencies(DependencyEdit::Remove { source, dependency })
                }
                DepsOperation::RemoveDependent { source, dependent } => {
                    Request::EditDependencies(DependencyEdit::RemoveDependent { source, dependent })
                }
            },
            Commands::History => Request::ListHistory,
        }
    }
}
