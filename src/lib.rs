//! ShardMaster - Coordination tier for a replicated key-value store
//!
//! The master sits between clients and a fleet of data nodes. It maps each
//! key to a replica group through generations of placement rules, replicates
//! writes, resolves reads under a configurable consistency mode and tracks
//! node health.
//!
//! # Architecture
//!
//! Every data node belongs to replica groups with up to three roles:
//! primary, secondary and tertiary. The newest rule generation receives all
//! writes; older generations stay readable so data written before a
//! re-sharding is still found.
//!
//! # Features
//!
//! - Weak, medium and strong read consistency
//! - Create-only and version-checked writes
//! - Tags: secondary index from a tag to the keys carrying it
//! - Optional transaction locks through an external lock manager
//! - Node pause/drain, dead/arrived marking and recovery mode
//! - Worker pool with session fairness for client connections
//! - HTTP API for node health and operator control

pub mod api;
pub mod config;
pub mod consistency;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod master;
pub mod network;
pub mod replication;
pub mod server;
pub mod state;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use config::MasterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MasterConfig;
    pub use crate::consistency::ConsistencyMode;
    pub use crate::error::{Error, Result};
    pub use crate::master::{MasterEngine, Operation, Payload, Request, Response};
    pub use crate::network::{NodeClient, NodeTransport};
    pub use crate::server::RequestDispatchLoop;
    pub use crate::state::{FailoverController, NodeDirectory, NodeHealth};
    pub use crate::version::VersionStamp;
}
