//! CLI argument parsing and command dispatch.

pub mod args;
pub mod commands;

use anyhow::Result;
use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;

/// Run the agent.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => AgentConfig::default_path()?,
    };

    match cli.command {
        Commands::Run => {
            let config = AgentConfig::load(&path)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));
            commands::run::execute(config).await
        }
        Commands::ShowConfig => commands::config::show(&path),
        Commands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over `level`.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
