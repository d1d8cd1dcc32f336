//! Replication Module
//!
//! Write fan-out and consistency-resolved reads across the replica roles of a
//! key.

mod attempt;
mod reader;
mod writer;

pub use attempt::{verdict, Answered, AttemptPlan, Verdict};
pub use reader::ReplicaReader;
pub use writer::{
    ReplicaWriteCoordinator, ReplicaWriteResult, WriteOutcome, WriteReport, ALREADY_REGISTERED, ALREADY_UPDATED,
};
