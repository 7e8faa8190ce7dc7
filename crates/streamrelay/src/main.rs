//! Streamrelay daemon - streaming relay in front of a completion API

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use streamrelay::config::Config;
use streamrelay::error::Result;
use streamrelay::proxy::ProxyServer;

/// Streamrelay - streaming chat relay with retry and model downgrade
#[derive(Parser)]
#[command(name = "streamrelay")]
#[command(about = "A streaming chat relay with retry, backoff and model downgrade")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,streamrelay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting streamrelay");

    let config = Config::load(config_path.as_deref())?;
    config.validate()?;
    tracing::debug!("Config loaded: {:?}", config.proxy);

    ProxyServer::new(config).serve().await?;

    tracing::info!("Streamrelay stopped");
    Ok(())
}
