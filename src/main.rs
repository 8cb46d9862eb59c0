use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use issue_enhancer::config::{Credentials, EnhancerConfig};
use issue_enhancer::telemetry::{LogFormat, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "issue-enhancer")]
#[command(version, about = "Enriches Linear issues with context from chat, documents, email and code")]
pub struct Cli {
    /// Path to enhancer.toml (defaults to <data-dir>/enhancer.toml when present)
    #[arg(long, global = true, env = "ENHANCER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and default config
    #[arg(long, global = true, env = "ENHANCER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Fmt)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server with background sync
    Serve {
        /// Port to listen on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Sync connectors into the local corpus now
    Sync {
        /// Only these connectors (comma-separated)
        #[arg(long)]
        only: Option<String>,
    },
    /// Show watermarks, corpus size and last sync time
    Status,
    /// List connectors and the credentials each one needs
    Connectors,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("issue-enhancer"))
        .unwrap_or_else(|| PathBuf::from(".issue-enhancer"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config = EnhancerConfig::load(&data_dir, cli.config.as_deref(), Credentials::from_env())?;

    match cli.command {
        Commands::Serve { port } => cmd::cmd_serve(config, port).await?,
        Commands::Sync { only } => cmd::cmd_sync(config, only.as_deref()).await?,
        Commands::Status => cmd::cmd_status(config).await?,
        Commands::Connectors => cmd::cmd_connectors(&config)?,
    }

    Ok(())
}
