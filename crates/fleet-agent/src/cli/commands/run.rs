//! `fleet-agent run` - keep the node in sync until interrupted.

use anyhow::{Context as _, Result};
use fleet_node::{HttpControlPlane, RuleSetApplier, SyncScheduler};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AgentConfig;

pub async fn execute(config: AgentConfig) -> Result<()> {
    let plane = HttpControlPlane::builder(config.control_plane.as_str())
        .timeout(config.request_timeout())
        .build()
        .with_context(|| format!("invalid control plane: {}", config.control_plane))?;

    let applier = Arc::new(RuleSetApplier::new());
    let handle = SyncScheduler::new(
        config.scheduler_config(),
        Arc::new(plane),
        config.bootstrap.to_record(),
    )
    .with_applier(Arc::clone(&applier) as Arc<_>)
    .spawn();

    info!(
        node_id = config.node_id,
        control_plane = %config.control_plane,
        "agent started"
    );

    let mut status = handle.status();
    let mut rules = applier.subscribe();
    let mut halted = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(error = %err, "failed to listen for shutdown signal");
                }
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.halted {
                    Some(err) if !halted => {
                        halted = true;
                        warn!(
                            node_id = config.node_id,
                            error = %err,
                            "node is halted; update the credential and restart the agent"
                        );
                    }
                    Some(_) => {}
                    None => halted = false,
                }
            }
            changed = rules.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = rules.borrow_and_update().clone();
                info!(
                    node_id = config.node_id,
                    ip_strategy = %current.ip_strategy(),
                    "rule set updated"
                );
            }
        }
    }

    info!(node_id = config.node_id, "shutting down");
    match handle.shutdown().await {
        Some(Ok(ack)) => info!(
            node_id = config.node_id,
            total = ack.cumulative.total(),
            "final report acknowledged"
        ),
        Some(Err(err)) => warn!(node_id = config.node_id, error = %err, "final report failed"),
        None => {}
    }
    Ok(())
}
