mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use logging::init_logging;

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, default_value = "/etc/sluice.yaml", env = "SLUICE_CONFIG")]
    config: PathBuf,

    /// Repeat for more verbose logs
    #[arg(long, short, action = clap::ArgAction::Count)]
    debug: u8,
}

#[derive(clap::Subcommand)]
pub(crate) enum Commands {
    /// Run the admission, rate limit, idempotency and quota services
    Run,
    /// Validate config file
    Check,
    /// Run a single reaper sweep and exit
    Reap,
    /// Print the JSON schema of the config file
    #[command(hide = true)]
    ConfigSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug)?;

    match &cli.command {
        Commands::Run => crate::commands::run::command(&cli).await,
        Commands::Check => crate::commands::check::command(&cli).await,
        Commands::Reap => crate::commands::reap::command(&cli).await,
        Commands::ConfigSchema => crate::commands::config_schema::command(),
    }
}
