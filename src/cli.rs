//! CLI interface for voicebridge

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::models::ModelClients;
use crate::server::{self, ServerState};

#[derive(Parser)]
#[command(name = "voicebridge")]
#[command(about = "Real-time multimodal voice conversation server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the conversation server (default when no command given)
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Explicit config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file location
    Path,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => serve(None, None, None).await,
        Some(Commands::Serve { host, port, config }) => serve(host, port, config).await,
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Show => {
                let config = Config::load()?;
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Path => {
                println!("{}", config::config_path()?.display());
                Ok(())
            }
        },
    }
}

async fn serve(host: Option<String>, port: Option<u16>, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let config = Arc::new(config);
    let clients = ModelClients::from_config(&config)?;
    server::start(ServerState::new(config, clients)).await
}
