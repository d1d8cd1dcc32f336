//! State Management Module
//!
//! Node identity, health tracking and the background health probe.

mod directory;
mod failover;
mod probe;

pub use directory::{NodeDescriptor, NodeDirectory, NodeEntry};
pub use failover::{FailoverController, FailureReason, HealthSummary, NodeHealth, NodeLease, NodeReport};
pub use probe::HealthProbe;
