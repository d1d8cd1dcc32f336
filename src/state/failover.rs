//! Node Health and Failover
//!
//! Tracks the health state of every data node and decides whether a node may
//! be used. The controller is the single owner of health; dispatch and the
//! replica coordinators consult it before every node use and report network
//! failures back into it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Health state of a data node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    /// Normal operation
    Arrived,
    /// Administratively paused; excluded from new dispatch
    Paused,
    /// Excluded from all dispatch until explicitly revived
    Dead,
}

impl NodeHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeHealth::Arrived,
            1 => NodeHealth::Paused,
            _ => NodeHealth::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            NodeHealth::Arrived => 0,
            NodeHealth::Paused => 1,
            NodeHealth::Dead => 2,
        }
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Arrived => write!(f, "ARRIVED"),
            NodeHealth::Paused => write!(f, "PAUSED"),
            NodeHealth::Dead => write!(f, "DEAD"),
        }
    }
}

/// Why a node use failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Could not open a connection
    Connect,
    /// Read or write failed on an open connection
    Io,
    /// No answer within the timeout
    Timeout,
    /// Answer could not be decoded
    Protocol,
    /// Health probe failed
    Ping,
}

impl FailureReason {
    /// Classify a transport error
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::ConnectionFailed { .. } => FailureReason::Connect,
            Error::ConnectionTimeout(_) => FailureReason::Timeout,
            Error::ChecksumMismatch(_) | Error::Serialization(_) => FailureReason::Protocol,
            _ => FailureReason::Io,
        }
    }
}

/// Per-node mutable state; every field is independently atomic
struct NodeSlot {
    health: AtomicU8,
    recovering: AtomicBool,
    in_flight: AtomicUsize,
    failures: AtomicU32,
    changed_at: Mutex<DateTime<Utc>>,
}

impl NodeSlot {
    fn new() -> Self {
        Self {
            health: AtomicU8::new(NodeHealth::Arrived.as_u8()),
            recovering: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            changed_at: Mutex::new(Utc::now()),
        }
    }

    fn health(&self) -> NodeHealth {
        NodeHealth::from_u8(self.health.load(Ordering::SeqCst))
    }

    fn eligible(&self) -> bool {
        self.recovering.load(Ordering::SeqCst) || self.health() == NodeHealth::Arrived
    }

    /// Move `from -> to`; false if the node was not in `from`
    fn transition(&self, from: NodeHealth, to: NodeHealth) -> bool {
        let moved = self
            .health
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            self.touch();
        }
        moved
    }

    fn touch(&self) {
        let mut changed = self.changed_at.lock().unwrap_or_else(|e| e.into_inner());
        *changed = Utc::now();
    }
}

/// Point-in-time view of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub name: String,
    pub health: NodeHealth,
    pub recovering: bool,
    pub eligible: bool,
    pub in_flight: usize,
    pub consecutive_failures: u32,
    pub changed_at: DateTime<Utc>,
}

/// Counts per health state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub arrived: usize,
    pub paused: usize,
    pub dead: usize,
    pub recovering: usize,
}

/// Marks one in-flight use of a node; released on drop
pub struct NodeLease {
    name: String,
    slot: Arc<NodeSlot>,
}

impl NodeLease {
    /// Node this lease belongs to
    pub fn node(&self) -> &str {
        &self.name
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for NodeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLease").field("node", &self.name).finish()
    }
}

/// Health registry shared by every component that touches data nodes
pub struct FailoverController {
    slots: HashMap<String, Arc<NodeSlot>>,
    failure_threshold: u32,
    drain_poll: Duration,
}

impl FailoverController {
    /// Create a controller tracking the given nodes, all initially `Arrived`
    pub fn new<I, S>(nodes: I, failure_threshold: u32, drain_poll: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = nodes
            .into_iter()
            .map(|name| (name.into(), Arc::new(NodeSlot::new())))
            .collect();

        Self {
            slots,
            failure_threshold: failure_threshold.max(1),
            drain_poll,
        }
    }

    fn slot(&self, name: &str) -> Result<&Arc<NodeSlot>> {
        self.slots
            .get(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    /// Whether the node is known
    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Current health, `None` for unknown nodes
    pub fn health(&self, name: &str) -> Option<NodeHealth> {
        self.slots.get(name).map(|slot| slot.health())
    }

    /// A node may be used when it is `Arrived` or flagged as recovering
    pub fn is_eligible(&self, name: &str) -> bool {
        self.slots.get(name).map(|slot| slot.eligible()).unwrap_or(false)
    }

    /// Register one in-flight use of the node if it is eligible.
    ///
    /// The counter is raised before the eligibility check so that a pause
    /// which flips the state concurrently always sees this use while draining.
    pub fn acquire(&self, name: &str) -> Option<NodeLease> {
        let slot = self.slots.get(name)?;
        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        let lease = NodeLease {
            name: name.to_string(),
            slot: Arc::clone(slot),
        };
        if slot.eligible() {
            Some(lease)
        } else {
            None
        }
    }

    /// Record a network failure; returns true when this failure killed the node
    pub fn record_failure(&self, name: &str, reason: FailureReason) -> bool {
        let Some(slot) = self.slots.get(name) else {
            return false;
        };

        let failures = slot.failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            "Node {} failure {:?} ({}/{})",
            name,
            reason,
            failures,
            self.failure_threshold
        );

        if failures >= self.failure_threshold && slot.transition(NodeHealth::Arrived, NodeHealth::Dead) {
            tracing::warn!(
                "Node {} marked DEAD after {} consecutive failures (last: {:?})",
                name,
                failures,
                reason
            );
            return true;
        }
        false
    }

    /// Record a successful use; clears the failure streak
    pub fn record_success(&self, name: &str) {
        if let Some(slot) = self.slots.get(name) {
            slot.failures.store(0, Ordering::SeqCst);
        }
    }

    /// Mark a node dead. Idempotent.
    pub fn mark_dead(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let previous = NodeHealth::from_u8(slot.health.swap(NodeHealth::Dead.as_u8(), Ordering::SeqCst));
        if previous != NodeHealth::Dead {
            slot.touch();
            tracing::warn!("Node {} marked DEAD by operator (was {})", name, previous);
        }
        Ok(())
    }

    /// Return a dead or paused node to service. Idempotent.
    pub fn mark_arrived(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        slot.failures.store(0, Ordering::SeqCst);
        let previous = NodeHealth::from_u8(slot.health.swap(NodeHealth::Arrived.as_u8(), Ordering::SeqCst));
        if previous != NodeHealth::Arrived {
            slot.touch();
            tracing::info!("Node {} ARRIVED (was {})", name, previous);
        }
        Ok(())
    }

    /// Pause a node and wait until no operation is using it
    pub async fn pause(&self, name: &str) -> Result<()> {
        let slot = Arc::clone(self.slot(name)?);
        if slot.transition(NodeHealth::Arrived, NodeHealth::Paused) {
            tracing::info!("Node {} PAUSED, draining in-flight operations", name);
        }

        loop {
            let in_flight = slot.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                break;
            }
            tracing::trace!("Node {} draining, {} in flight", name, in_flight);
            tokio::time::sleep(self.drain_poll).await;
        }

        tracing::debug!("Node {} drained", name);
        Ok(())
    }

    /// Resume a paused node. A dead node stays dead.
    pub fn resume(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        if slot.transition(NodeHealth::Paused, NodeHealth::Arrived) {
            tracing::info!("Node {} resumed", name);
        }
        Ok(())
    }

    /// Force the node into read and write dispatch while it resynchronizes
    pub fn start_recovery(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        if !slot.recovering.swap(true, Ordering::SeqCst) {
            slot.touch();
            tracing::info!("Node {} entered recovery mode", name);
        }
        Ok(())
    }

    /// Clear the recovery flag
    pub fn end_recovery(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        if slot.recovering.swap(false, Ordering::SeqCst) {
            slot.touch();
            tracing::info!("Node {} left recovery mode", name);
        }
        Ok(())
    }

    /// Report for one node
    pub fn report(&self, name: &str) -> Option<NodeReport> {
        self.slots.get(name).map(|slot| Self::make_report(name, slot))
    }

    /// Reports for every node, sorted by name
    pub fn reports(&self) -> Vec<NodeReport> {
        let mut reports: Vec<NodeReport> = self
            .slots
            .iter()
            .map(|(name, slot)| Self::make_report(name, slot))
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Names of nodes currently `Arrived`
    pub fn arrived_nodes(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.health() == NodeHealth::Arrived)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Counts per health state
    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            total: self.slots.len(),
            ..Default::default()
        };
        for slot in self.slots.values() {
            match slot.health() {
                NodeHealth::Arrived => summary.arrived += 1,
                NodeHealth::Paused => summary.paused += 1,
                NodeHealth::Dead => summary.dead += 1,
            }
            if slot.recovering.load(Ordering::SeqCst) {
                summary.recovering += 1;
            }
        }
        summary
    }

    fn make_report(name: &str, slot: &NodeSlot) -> NodeReport {
        NodeReport {
            name: name.to_string(),
            health: slot.health(),
            recovering: slot.recovering.load(Ordering::SeqCst),
            eligible: slot.eligible(),
            in_flight: slot.in_flight.load(Ordering::SeqCst),
            consecutive_failures: slot.failures.load(Ordering::SeqCst),
            changed_at: *slot.changed_at.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}
