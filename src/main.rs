mod cli;
mod daemon;

use clap::Parser;
use cli::{Cli, Commands};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    if let Some(path) = renderferry::observability::init_tracing(&cli.log_settings())? {
        tracing::info!(path = %path.display(), "Logging to file");
    }

    match cli.command {
        Commands::Download(args) => daemon::run(args).await,
        Commands::Config(args) => daemon::show_config(args),
    }
}
