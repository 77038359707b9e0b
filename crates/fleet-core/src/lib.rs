//! Core types and traits for the fleet node sync protocol.
//!
//! This crate provides the pieces shared by the node agent and the control
//! plane:
//!
//! - **Types**: [`ConfigRecord`] and its DNS/outbound rules, [`TrafficSample`],
//!   and the pull/push protocol messages
//! - **Codec**: the [`WireCodec`] trait every wire record implements
//! - **Rules**: [`RuleSet`], the compiled form a node evaluates per connection
//! - **Errors**: the [`SyncError`] taxonomy shared by both sides
//!
//! # Example
//!
//! ```rust
//! use fleet_core::{ConfigRecord, WireCodec};
//!
//! let bytes = br#"{"NodePullInterval":30,"Block":["ads.example.com"]}"#;
//! let record = ConfigRecord::decode(bytes).unwrap();
//! assert_eq!(record.pull_interval().as_secs(), 30);
//! ```

pub mod codec;
mod error;
pub mod rules;
pub mod types;

pub use codec::WireCodec;
pub use error::{CodecError, Result, SyncError};
pub use rules::{Route, RuleSet};
pub use types::*;
