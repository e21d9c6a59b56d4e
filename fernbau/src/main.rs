//! fernbau binary
//!
//! Parses the command line, loads the workspace configuration, picks a
//! transport and hands the request to the coordinator.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fernbau::commands::Cli;
use fernbau::config::FernbauConfig;
use fernbau::dispatch::Level;
use fernbau::{BuildCoordinator, Request, dispatch};
use fernbau_remote::{LocalTransport, SshTransport, Transport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "fernbau=debug,fernbau_remote=debug"
    } else {
        "fernbau=info,fernbau_remote=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match FernbauConfig::load(&cli.workspace).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let transport = transport(&cli.workspace, cli.local_remote.as_deref(), &mut config);
    let coordinator = BuildCoordinator::new(&cli.workspace, config, transport);

    let response = dispatch(&coordinator, Request::from(cli.command)).await;
    match response.level {
        Level::Info => {
            println!("{}", response.message);
            ExitCode::SUCCESS
        }
        Level::Warning => {
            println!("{}", response.message);
            ExitCode::from(2)
        }
        Level::Error => {
            eprintln!("error: {}", response.message);
            ExitCode::FAILURE
        }
    }
}

/// Pick the transport. A local build host directory also becomes the
/// remote base directory.
fn transport(
    workspace: &Path,
    local_remote: Option<&Path>,
    config: &mut FernbauConfig,
) -> Arc<dyn Transport> {
    if let Some(dir) = local_remote {
        let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
        config.remote.base_dir = Some(dir.display().to_string());
        return Arc::new(LocalTransport::new(workspace, dir));
    }

    let host = config.remote.host.clone().unwrap_or_else(|| "localhost".to_string());
    let base = config.remote.base_dir.clone().unwrap_or_default();
    let mut ssh = SshTransport::new(host, workspace, base);
    if let Some(user) = &config.remote.user {
        ssh = ssh.with_user(user.clone());
    }
    if let Some(port) = config.remote.port {
        ssh = ssh.with_port(port);
    }
    Arc::new(ssh)
}
