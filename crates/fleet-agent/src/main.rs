//! fleet-agent - edge node sync agent
//!
//! Pulls the node's configuration from the control plane and reports traffic
//! back until interrupted.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    fleet_agent::run().await
}
