use anyhow::Result;
use clap::Parser;

use docwatch::Settings;
use docwatch::cli::commands::{init, watch};
use docwatch::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;

    docwatch::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Init { force } => init::run_init(force),
        Commands::Config => init::run_config(&settings),
        Commands::Watch(args) => watch::run(args, settings).await,
    }
}
