use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod gen_secret;
pub mod init;
pub mod migrate;
pub mod serve;

#[derive(Parser)]
#[command(name = "ballotbox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-hosted polling backend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Path to config file (default: ~/.config/ballotbox/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Apply the database schema and exit
    Migrate {
        /// Path to config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Write a starter config file with a fresh master secret
    Init {
        /// Where to write the config (default: ~/.config/ballotbox/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print a fresh master secret (hex)
    GenSecret,
}

/// Default config location, adjacent to the user's other service configs.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ballotbox")
        .join("config.toml")
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Serve { config } => serve::execute(config).await,
        Commands::Migrate { config } => migrate::execute(config).await,
        Commands::Init { config } => init::execute(config),
        Commands::GenSecret => {
            gen_secret::execute();
            Ok(())
        }
    }
}
