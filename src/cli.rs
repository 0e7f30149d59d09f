use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::watcher::ConfigWatcher;
use crate::config::{Config, TransportMode, load_config};
use crate::gateway::Gateway;
use crate::server::Server;

#[derive(Parser)]
#[command(name = "contextify", version, about = "Policy-driven MCP tool server and gateway")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the in-process tool server (default).
    Serve,
    /// Run the multi-upstream gateway.
    Gateway,
    /// Validate the configuration and exit.
    Check,
}

/// Entry point. Returns the process exit code: 0 on clean shutdown, 1 on
/// unrecoverable startup failure.
pub async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Check => {
            info!("configuration is valid");
            0
        }
        Command::Serve => run_server(&config, cli.config.as_deref()).await,
        Command::Gateway => run_gateway(&config).await,
    }
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_server(config: &Config, config_path: Option<&Path>) -> i32 {
    let server = match Server::from_config(config) {
        Ok(server) => server,
        Err(e) => {
            error!("server startup failed: {}", e);
            return 1;
        }
    };
    let cancel = shutdown_token();

    // Watch the config file so endpoint and inline-policy edits take
    // effect without a restart. The watcher handle must outlive serving.
    let _config_watcher = config_path.and_then(|path| {
        match ConfigWatcher::start(path, config.clone()) {
            Ok(watcher) => {
                server.spawn_config_listener(watcher.updates(), cancel.clone());
                Some(watcher)
            }
            Err(e) => {
                warn!("config watching disabled: {}", e);
                None
            }
        }
    });

    let result = match config.core.transport_mode {
        TransportMode::Stdio => crate::server::serve_stdio(server, cancel).await,
        TransportMode::Both => {
            let http = crate::server::serve_http(
                server.clone(),
                &config.core.listen_host,
                config.core.listen_port,
                cancel.clone(),
            );
            let stdio = crate::server::serve_stdio(server, cancel);
            tokio::select! {
                r = http => r,
                r = stdio => r,
            }
        }
        // Auto resolves to HTTP; stdio is opt-in because a detached
        // stdin would end the loop immediately.
        TransportMode::Auto | TransportMode::Http => {
            crate::server::serve_http(
                server,
                &config.core.listen_host,
                config.core.listen_port,
                cancel,
            )
            .await
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("server failed: {}", e);
            1
        }
    }
}

async fn run_gateway(config: &Config) -> i32 {
    let gateway: Arc<Gateway> = match Gateway::from_config(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("gateway startup failed: {}", e);
            return 1;
        }
    };
    let cancel = shutdown_token();

    match crate::gateway::serve(
        gateway,
        &config.core.listen_host,
        config.core.listen_port,
        cancel,
    )
    .await
    {
        Ok(()) => 0,
        Err(e) => {
            error!("gateway failed: {}", e);
            1
        }
    }
}
