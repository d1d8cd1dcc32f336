//! Lock Coordinator
//!
//! Advisory per-key locks held by the external transaction manager. This
//! component only forwards requests; lock state lives on the manager.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::network::{NodeRequest, NodeResponse, NodeTransport, TimeoutClass};
use crate::state::NodeDescriptor;

/// Client for the transaction manager
pub struct LockCoordinator {
    /// `None` when transaction mode is off
    manager: Option<Arc<NodeDescriptor>>,
    transport: Arc<dyn NodeTransport>,
    gate_timeout: Duration,
    poll_interval: Duration,
}

impl LockCoordinator {
    pub fn new(
        manager: Option<NodeDescriptor>,
        transport: Arc<dyn NodeTransport>,
        gate_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager: manager.map(Arc::new),
            transport,
            gate_timeout,
            poll_interval,
        }
    }

    pub fn from_config(config: &MasterConfig, transport: Arc<dyn NodeTransport>) -> Result<Self> {
        let manager = match (&config.transaction.manager, config.transaction.enabled) {
            (Some(address), true) => Some(NodeDescriptor::parse(address)?),
            _ => None,
        };
        Ok(Self::new(
            manager,
            transport,
            Duration::from_millis(config.transaction.lock_gate_timeout_ms),
            Duration::from_millis(config.transaction.lock_poll_interval_ms),
        ))
    }

    /// Whether transaction mode is on
    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    fn manager(&self) -> Result<&Arc<NodeDescriptor>> {
        self.manager.as_ref().ok_or(Error::TransactionDisabled)
    }

    /// Acquire `key` for `transaction`, letting the manager wait up to
    /// `wait_secs`. `hold_secs = 0` holds until unlocked.
    ///
    /// An unreachable manager counts as a failed acquisition.
    pub async fn lock(&self, key: &[u8], transaction: &str, hold_secs: u64, wait_secs: u64) -> Result<bool> {
        let manager = self.manager()?;
        let request = NodeRequest::Lock {
            key: key.to_vec(),
            transaction: transaction.to_string(),
            hold_secs,
            wait_secs,
        };
        let class = TimeoutClass::Wait(Duration::from_secs(wait_secs));

        match self.transport.call(manager, request, class).await {
            Ok(NodeResponse::LockGranted) => Ok(true),
            Ok(NodeResponse::Rejected { reason }) => {
                tracing::debug!("Lock on {} refused for {}: {}", String::from_utf8_lossy(key), transaction, reason);
                Ok(false)
            }
            Ok(other) => Err(unexpected(manager, key, &other)),
            Err(e) if e.is_network() => {
                tracing::warn!("Transaction manager {} unreachable for lock: {}", manager, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Release `key` if `transaction` owns it
    pub async fn unlock(&self, key: &[u8], transaction: &str) -> Result<bool> {
        let manager = self.manager()?;
        let request = NodeRequest::Unlock {
            key: key.to_vec(),
            transaction: transaction.to_string(),
        };

        match self.transport.call(manager, request, TimeoutClass::Standard).await {
            Ok(NodeResponse::LockReleased) => Ok(true),
            Ok(NodeResponse::Rejected { .. }) => Ok(false),
            Ok(other) => Err(unexpected(manager, key, &other)),
            Err(e) if e.is_network() => {
                tracing::warn!("Transaction manager {} unreachable for unlock: {}", manager, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Transaction currently holding `key`
    pub async fn query_owner(&self, key: &[u8]) -> Result<Option<String>> {
        let manager = self.manager()?;
        let request = NodeRequest::LockOwner { key: key.to_vec() };

        match self.transport.call(manager, request, TimeoutClass::Standard).await? {
            NodeResponse::LockHolder(owner) => Ok(owner),
            other => Err(unexpected(manager, key, &other)),
        }
    }

    /// Wait until `key` is unlocked or owned by `transaction`.
    ///
    /// Passes immediately when transaction mode is off. Gives up with
    /// `LockHeld` after the gate timeout.
    pub async fn gate(&self, key: &[u8], transaction: Option<&str>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let deadline = Instant::now() + self.gate_timeout;
        loop {
            match self.query_owner(key).await? {
                None => return Ok(()),
                Some(owner) if Some(owner.as_str()) == transaction => return Ok(()),
                Some(owner) => {
                    if Instant::now() >= deadline {
                        tracing::debug!(
                            "Write to {} blocked by lock held by {}",
                            String::from_utf8_lossy(key),
                            owner
                        );
                        return Err(Error::LockHeld);
                    }
                }
            }

            let jitter = rand::thread_rng().gen_range(0..=self.poll_interval.as_millis() as u64 / 2);
            tokio::time::sleep(self.poll_interval + Duration::from_millis(jitter)).await;
        }
    }
}

fn unexpected(manager: &NodeDescriptor, key: &[u8], response: &NodeResponse) -> Error {
    tracing::error!(
        "Unexpected answer from transaction manager {} for key {}: {:?}",
        manager,
        String::from_utf8_lossy(key),
        response
    );
    Error::UnexpectedResponse {
        node: manager.full_name.clone(),
        detail: response.type_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryCluster;

    fn coordinator(cluster: &Arc<MemoryCluster>) -> LockCoordinator {
        LockCoordinator::new(
            Some(NodeDescriptor::parse("tm:1").unwrap()),
            cluster.clone(),
            Duration::from_millis(60),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let cluster = Arc::new(MemoryCluster::new(["tm:1"]));
        let locks = coordinator(&cluster);

        assert!(locks.lock(b"k2", "T1", 0, 1).await.unwrap());
        assert_eq!(locks.query_owner(b"k2").await.unwrap().as_deref(), Some("T1"));
        assert!(!locks.lock(b"k2", "T2", 0, 1).await.unwrap());
        assert!(!locks.unlock(b"k2", "T2").await.unwrap());
        assert!(locks.unlock(b"k2", "T1").await.unwrap());
        assert_eq!(locks.query_owner(b"k2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_mode_fails_fast() {
        let cluster = Arc::new(MemoryCluster::new(["tm:1"]));
        let locks = LockCoordinator::new(None, cluster.clone(), Duration::from_millis(10), Duration::from_millis(1));

        assert!(matches!(locks.lock(b"k", "T1", 0, 1).await, Err(Error::TransactionDisabled)));
        assert!(matches!(locks.unlock(b"k", "T1").await, Err(Error::TransactionDisabled)));
        assert!(matches!(locks.query_owner(b"k").await, Err(Error::TransactionDisabled)));
        locks.gate(b"k", None).await.unwrap();
        assert!(cluster.requests("tm:1").is_empty());
    }

    #[tokio::test]
    async fn test_manager_outage_is_not_fatal() {
        let cluster = Arc::new(MemoryCluster::new(["tm:1"]));
        cluster.set_down("tm:1", true);
        let locks = coordinator(&cluster);

        assert!(!locks.lock(b"k", "T1", 0, 1).await.unwrap());
        assert_eq!(cluster.requests("tm:1").len(), 0);
    }

    #[tokio::test]
    async fn test_gate_blocks_foreign_owner() {
        let cluster = Arc::new(MemoryCluster::new(["tm:1"]));
        let locks = coordinator(&cluster);
        locks.lock(b"k2", "T1", 0, 1).await.unwrap();

        locks.gate(b"k2", Some("T1")).await.unwrap();
        assert!(matches!(locks.gate(b"k2", Some("T2")).await, Err(Error::LockHeld)));
        assert!(matches!(locks.gate(b"k2", None).await, Err(Error::LockHeld)));

        locks.unlock(b"k2", "T1").await.unwrap();
        locks.gate(b"k2", Some("T2")).await.unwrap();
    }
}
