//! Command-line argument definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Edge node agent for the fleet control plane
///
/// Pulls the node's configuration and reports traffic usage back.
#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: <config dir>/fleet/agent.toml)
    #[arg(short, long, env = "FLEET_AGENT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, overrides the config file (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Keep the node in sync until interrupted
    Run,

    /// Print the effective configuration (credential masked)
    ShowConfig,

    /// Print the default config file path
    Path,
}
