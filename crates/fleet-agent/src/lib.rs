//! # fleet-agent
//!
//! Node agent for the fleet sync protocol.
//!
//! - **run**: keep the node in sync with the control plane until Ctrl-C,
//!   then flush remaining traffic once
//! - **show-config**: print the effective configuration with the credential
//!   masked
//! - **path**: print the default configuration file location

pub mod cli;
pub mod config;

pub use cli::run;
