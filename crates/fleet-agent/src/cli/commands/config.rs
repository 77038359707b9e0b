//! `fleet-agent show-config` - print the effective configuration.

use anyhow::Result;
use std::path::Path;

use crate::config::AgentConfig;

pub fn show(path: &Path) -> Result<()> {
    let config = AgentConfig::load(path)?;
    println!("# {}", path.display());
    print!("{}", config.masked_toml()?);
    Ok(())
}
