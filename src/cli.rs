//! Command-line interface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::bridge::VoiceBridge;
use crate::config::Config;
use crate::server;

#[derive(Parser)]
#[command(name = "voice-bridge")]
#[command(about = "Real-time voice assistant bridge between an ARI PBX and a streaming Live API")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "VOICE_BRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the bridge (default)
    Serve,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::CheckConfig => {
            config.validate().context("configuration invalid")?;
            println!("configuration OK");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    config
        .validate()
        .context("refusing to start with invalid configuration")?;

    let http = config.http.clone();
    let bridge = VoiceBridge::start(config)
        .await
        .context("Failed to start voice bridge")?;

    let api_bridge = bridge.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = server::serve(api_bridge, &http.host, http.port).await {
            error!("control API exited: {e:#}");
        }
    });

    info!("voice bridge running; press Ctrl-C to stop");
    shutdown_signal().await;

    info!("shutdown signal received");
    api_task.abort();
    bridge.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
