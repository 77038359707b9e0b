mod db;
mod protocol;
mod record;
mod traffic;

pub use db::*;
pub use protocol::*;
pub use record::*;
pub use traffic::*;

/// Control-plane identifier of a node
pub type NodeId = u64;
