//! # vibrant
//!
//! Command broker binary: accepts browser agent WebSocket subscriptions and
//! relays commands from HTTP callers to them.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use vibrant_server::config::DEFAULT_WELCOME_SCRIPT;
use vibrant_server::{load_config, ServerConfig};
use vibrant_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "vibrant", about = "Browser agent command broker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker server.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Host to bind (overrides the config file).
    #[arg(long, env = "VIBRANT_HOST")]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides the config file).
    #[arg(long, env = "VIBRANT_PORT")]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long, env = "VIBRANT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Send the built-in welcome script to every agent that connects.
    #[arg(long)]
    welcome: bool,
}

impl ServeArgs {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.welcome && config.welcome_script.is_none() {
            config.welcome_script = Some(DEFAULT_WELCOME_SCRIPT.to_owned());
        }
        config.validate().context("Invalid server configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.server_config()?;

    let telemetry = init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        json: args.log_json,
        ..TelemetryConfig::default()
    })
    .context("Failed to initialize telemetry")?;

    let handle = vibrant_server::start(config, telemetry.metrics_handle())
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr(), "listening for agents");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
