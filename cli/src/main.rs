//! restexec — sandboxed code execution service and MCP gateway.
//!
//! Two subcommands:
//! - `restexec serve`: HTTP service that stores, lints and executes
//!   TypeScript artifacts in permissioned interpreter subprocesses
//! - `restexec gateway`: HTTP gateway multiplexing tool calls across
//!   managed MCP child processes

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use restexec::config::parse_auth_settings;
use restexec::{GatewaySettings, LogFormat, ServiceConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// restexec — sandboxed code execution service and MCP gateway.
#[derive(Parser)]
#[command(
    name = "restexec",
    version,
    about = "restexec — sandboxed code execution service and MCP gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the code execution service (configuration from environment)
    Serve {
        /// Override the PORT environment variable
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Start the MCP gateway
    Gateway {
        /// Path to the YAML server config [default: $CONFIG_PATH]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the PORT environment variable
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Signal handler — cancels the root token for graceful shutdown.
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutting down restexec...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { port } => run_serve(port, cancel).await,
        Commands::Gateway { config, port } => run_gateway(config, port, cancel).await,
    }
}

/// Start the execution service. Exit code 1 on configuration failure.
async fn run_serve(port_override: Option<u16>, cancel: CancellationToken) -> Result<()> {
    let mut config = ServiceConfig::from_env()
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;
    if let Some(port) = port_override {
        config.port = port;
    }

    init_tracing(&config.log_level, config.log_format);
    tracing::info!(
        port = config.port,
        workspace_dir = %config.workspace_dir.display(),
        auth_enabled = config.auth.enabled,
        "starting execution service"
    );

    restexec::server::run(config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("execution service failed: {e}"))
}

/// Start the MCP gateway. Exit code 1 on configuration failure.
async fn run_gateway(
    config_path: Option<PathBuf>,
    port_override: Option<u16>,
    cancel: CancellationToken,
) -> Result<()> {
    let vars: HashMap<String, String> = std::env::vars().collect();

    let config_path = config_path
        .or_else(|| vars.get("CONFIG_PATH").map(PathBuf::from))
        .ok_or_else(|| anyhow::anyhow!("no gateway config: pass --config or set CONFIG_PATH"))?;

    let auth = parse_auth_settings(&vars).map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;
    let port = match port_override {
        Some(port) => port,
        None => match vars.get("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT '{raw}' is not a valid port number"))?,
            None => 3000,
        },
    };

    let (log_level, log_format) = log_settings(&vars)?;
    init_tracing(&log_level, log_format);

    let settings = GatewaySettings::load(&config_path)
        .await
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;
    tracing::info!(
        port,
        config = %config_path.display(),
        servers = settings.servers.len(),
        "starting MCP gateway"
    );

    restexec::gateway::run(settings, auth, port, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("gateway failed: {e}"))
}

fn log_settings(vars: &HashMap<String, String>) -> Result<(String, LogFormat)> {
    let level = match vars.get("LOG_LEVEL").map(String::as_str).unwrap_or("info") {
        level @ ("debug" | "info" | "warn" | "error") => level.to_string(),
        other => anyhow::bail!("LOG_LEVEL '{other}' is not one of debug, info, warn, error"),
    };
    let format = match vars.get("LOG_FORMAT").map(String::as_str).unwrap_or("text") {
        "json" => LogFormat::Json,
        "text" => LogFormat::Text,
        other => anyhow::bail!("LOG_FORMAT '{other}' is not one of json, text"),
    };
    Ok((level, format))
}

/// Initialize tracing: RUST_LOG wins over LOG_LEVEL, stderr writer, JSON or
/// text lines per LOG_FORMAT.
fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
