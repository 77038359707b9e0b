//! Control-plane side of the fleet sync protocol.
//!
//! [`DistributionService`] resolves node configs, answers pulls, and commits
//! traffic reports idempotently. Persistence sits behind [`NodeStore`];
//! [`InMemoryNodeStore`] is the bundled implementation.
//!
//! # Example
//!
//! ```rust
//! use fleet_control::DistributionService;
//! use fleet_core::{ConfigRecord, Credential};
//!
//! # tokio_test::block_on(async {
//! let service = DistributionService::in_memory()?;
//! service.provision(7, Credential::new("node-secret")).await?;
//! let version = service
//!     .publish(7, ConfigRecord { node_secret: "node-secret".into(), ..Default::default() })
//!     .await?;
//! assert_eq!(version, 1);
//! # Ok::<(), fleet_control::ControlError>(())
//! # }).unwrap();
//! ```

mod error;
mod local;
mod service;
pub mod store;

pub use error::{ControlError, Result};
pub use local::LocalControlPlane;
pub use service::DistributionService;
pub use store::{InMemoryNodeStore, NodeRecord, NodeStore, UsageCommit};
