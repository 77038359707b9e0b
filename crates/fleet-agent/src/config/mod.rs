//! Agent configuration.

use anyhow::{bail, Context as _, Result};
use fleet_core::{ConfigRecord, Credential, NodeId, WireCodec};
use fleet_node::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration file (`agent.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This node's control-plane ID.
    pub node_id: NodeId,

    /// Node credential.
    pub credential: Credential,

    /// Control plane base URL.
    pub control_plane: String,

    /// Per-request timeout before clamping to half the loop interval.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Record used until the first successful pull.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Record defaults used before the control plane has answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Seconds between pulls (0 = default).
    #[serde(default)]
    pub pull_interval_secs: i64,

    /// Seconds between pushes (0 = default).
    #[serde(default)]
    pub push_interval_secs: i64,

    /// Bytes that trigger an early push (0 = timer only).
    #[serde(default)]
    pub traffic_report_threshold: i64,

    /// IP strategy.
    #[serde(default)]
    pub ip_strategy: String,
}

impl BootstrapConfig {
    /// The bootstrap record
    pub fn to_record(&self) -> ConfigRecord {
        ConfigRecord {
            pull_interval: self.pull_interval_secs,
            push_interval: self.push_interval_secs,
            traffic_report_threshold: self.traffic_report_threshold,
            ip_strategy: self.ip_strategy.clone(),
            ..Default::default()
        }
    }
}

const fn default_request_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    String::from("info")
}

impl AgentConfig {
    /// Default config file path: `<config dir>/fleet/agent.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(dir.join("fleet").join("agent.toml"))
    }

    /// Load and validate configuration from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!(
                "config file not found: {}\n\n\
                 Create it with at least:\n  \
                 node_id = 1\n  \
                 credential = \"<node secret>\"\n  \
                 control_plane = \"https://panel.example.com\"",
                path.display()
            );
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.credential.is_empty() {
            bail!("credential must not be empty");
        }
        if self.control_plane.is_empty() {
            bail!("control_plane must not be empty");
        }
        self.bootstrap
            .to_record()
            .validate()
            .context("invalid [bootstrap] section")?;
        Ok(())
    }

    /// Per-request timeout
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Scheduler settings derived from this config
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.node_id, self.credential.clone())
            .request_timeout(self.request_timeout())
    }

    /// TOML rendering with the credential masked.
    pub fn masked_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        shown.credential = Credential::new(self.credential.masked());
        Ok(toml::to_string_pretty(&shown)?)
    }
}
