use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sitecraft::config::CONFIG_FILE_NAME;
use sitecraft::telemetry::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "sitecraft")]
#[command(about = "Live-preview site editing sessions over a streaming socket", version)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// View, validate or create the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Mint a GitHub installation token and print its expiry
    MintToken,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (secrets redacted)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default sitecraft.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(&cli.config, host.clone(), *port, *dev).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
        Commands::MintToken => cmd::cmd_mint_token(&cli.config).await?,
    }

    Ok(())
}
