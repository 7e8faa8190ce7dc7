use std::path::PathBuf;

use clap::{Parser, Subcommand};
use streamrelay_cli::commands::ChatCommand;
use streamrelay_cli::error::CliResult;
use streamrelay_cli::output::OutputFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "streamrelay-cli")]
#[command(about = "Streamrelay CLI - Terminal chat client for the streamrelay relay")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Emit events as JSON lines")]
    pub json: bool,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Start an interactive chat session")]
    Chat(ChatCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    init_logging();

    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match &cli.command {
        Command::Chat(cmd) => cmd.execute(cli.config.as_deref(), format).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,streamrelay=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
