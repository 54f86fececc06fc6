//! callsync CLI entry point.

use anyhow::Result;
use clap::Parser;

use callsync::cli::{handle_error, Cli, Commands};
use callsync::domain::models::Config;
use callsync::infrastructure::config::ConfigLoader;
use callsync::infrastructure::logging::{LogConfig, LoggerImpl};

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let _logger = LoggerImpl::init(&LogConfig::from_settings(&config.logging)?)?;

    match cli.command {
        Commands::Simulate(args) => {
            callsync::cli::commands::simulate::execute(args, &config, cli.json).await
        }
        Commands::Config(args) => callsync::cli::commands::config::execute(args, &config, cli.json),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(err) = run(cli).await {
        handle_error(err, json);
    }
}
