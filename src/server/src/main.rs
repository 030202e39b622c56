//! podmuxd - attach/exec streaming daemon.
//!
//! Serves the HTTP compat API (and optionally the upgraded RPC socket) for
//! the containers declared in its configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use podmux_core::{LogFormat, LogLevel, ServerConfig};
use podmux_server::{Daemon, ProcessRuntime};

/// podmux streaming daemon
#[derive(Parser, Debug)]
#[command(name = "podmuxd", version, about = "Attach/exec streaming daemon")]
struct Args {
    /// YAML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Unix socket for the HTTP API (overrides the config file).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Unix socket for the upgraded RPC API.
    #[arg(long)]
    rpc_socket: Option<PathBuf>,

    /// Exit after this many idle seconds (0 = never).
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Default detach key sequence.
    #[arg(long)]
    detach_keys: Option<String>,

    /// Log level (debug, info, warn, error).
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Log output format (text, json).
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(socket) = self.socket {
            config.api_socket = socket;
        }
        if let Some(socket) = self.rpc_socket {
            config.rpc_socket = Some(socket);
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(keys) = self.detach_keys {
            config.detach_keys = keys;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_tracing(&config);

    tracing::info!(
        version = podmux_core::VERSION,
        socket = %config.api_socket.display(),
        rpc_socket = ?config.rpc_socket,
        containers = config.containers.len(),
        idle_timeout_secs = config.idle_timeout_secs,
        "Starting podmuxd"
    );

    let runtime = Arc::new(ProcessRuntime::from_config(&config));
    let daemon = Daemon::new(config, runtime);
    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                futures::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("podmuxd stopped");
    Ok(())
}
