//! CLI module for Krustron
//!
//! - `serve`: run the live hub and event bus server (default)
//! - `provision`: ensure every domain stream exists, then exit
//! - `config`: print the effective configuration as TOML

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use krustron::server::{self, AppConfig};

/// Krustron real-time event server
#[derive(Parser, Debug)]
#[command(name = "krustron")]
#[command(about = "Real-time event distribution for the Krustron control plane")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default)
    Serve {
        /// Override `server.host`
        #[arg(long)]
        host: Option<String>,
        /// Override `server.port`
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create missing event streams and exit
    Provision,
    /// Print the effective configuration
    Config,
}

/// Run the CLI command
pub async fn run(cli: Cli, mut config: AppConfig) -> Result<()> {
    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            info!("Starting Krustron v{}", env!("CARGO_PKG_VERSION"));
            server::run(config).await
        }
        Commands::Provision => {
            let created = server::provision(&config).await?;
            info!(created, "Streams provisioned");
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
