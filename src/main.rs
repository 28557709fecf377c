use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use revive::config::ReviveConfig;
use revive::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "revive")]
#[command(version, about = "Repository integration service driven by an AI coding agent")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "5000")]
        port: u16,

        /// Root directory for per-job work directories
        #[arg(long, default_value = "./work_dir")]
        work_dir: PathBuf,

        /// Directory holding revive.toml
        #[arg(long, default_value = ".")]
        config_dir: PathBuf,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "revive=debug" } else { "revive=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            work_dir,
            config_dir,
            dev,
        } => {
            let revive = ReviveConfig::load(&config_dir)?;
            let config = ServerConfig {
                port,
                work_root: work_dir,
                dev_mode: dev,
            };
            start_server(config, revive).await?;
        }
    }

    Ok(())
}
