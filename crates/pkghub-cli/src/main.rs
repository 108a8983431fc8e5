//! pkghub - package registry indexing pipeline CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pkghub_cli::cmd;
use pkghub_cli::context::open_hub;
use pkghub_cli::{Cli, Commands, DenyCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let hub = open_hub(&cli).await?;

    match cli.command {
        Commands::Serve { events } => cmd::serve::serve(&hub, events.as_deref()).await,
        Commands::Submit {
            tarball,
            name,
            version,
        } => cmd::submit::submit(&hub, &tarball, name.as_deref(), version.as_deref()).await,
        Commands::Rebuild => cmd::rebuild::rebuild(&hub).await,
        Commands::Catalog { json } => cmd::catalog::catalog(&hub, json).await,
        Commands::Deny { command } => match command {
            DenyCommands::Show => cmd::deny::show(&hub),
            DenyCommands::Set { file } => cmd::deny::set(&hub, &file).await,
        },
        Commands::Inventory => cmd::inventory::inventory(&hub).await,
        Commands::PruneVersions => cmd::prune::prune_versions(&hub).await,
    }
}
