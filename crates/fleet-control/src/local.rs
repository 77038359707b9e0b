//! In-process control plane.

use async_trait::async_trait;
use fleet_core::{ControlPlane, PullRequest, PullResponse, PushAck, PushRequest, Result};
use std::sync::Arc;

use crate::service::DistributionService;

/// In-process [`ControlPlane`] backed by a [`DistributionService`].
///
/// Lets a node scheduler run against a control plane in the same process,
/// e.g. for embedded deployments and integration tests.
#[derive(Clone)]
pub struct LocalControlPlane {
    service: Arc<DistributionService>,
}

impl LocalControlPlane {
    /// Wrap a service
    #[must_use]
    pub const fn new(service: Arc<DistributionService>) -> Self {
        Self { service }
    }

    /// The wrapped service
    #[must_use]
    pub fn service(&self) -> &Arc<DistributionService> {
        &self.service
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        self.service.pull(&request).await
    }

    async fn push(&self, request: PushRequest) -> Result<PushAck> {
        self.service
            .apply_report(request.node_id, &request.credential, &request.sample)
            .await
    }
}
