//! Health Probe
//!
//! Periodically pings every `Arrived` node so that a node which stopped
//! answering is marked dead even when no client traffic reaches it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::directory::NodeDirectory;
use super::failover::FailureReason;
use crate::network::{NodeRequest, NodeResponse, NodeTransport, TimeoutClass};

/// Background pinger for data nodes
pub struct HealthProbe {
    directory: Arc<NodeDirectory>,
    transport: Arc<dyn NodeTransport>,
    period: Duration,
    shutdown: watch::Sender<bool>,
}

impl HealthProbe {
    pub fn new(directory: Arc<NodeDirectory>, transport: Arc<dyn NodeTransport>, period: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            directory,
            transport,
            period,
            shutdown,
        }
    }

    /// Ping every arrived node once; returns the number that answered
    pub async fn probe_once(&self) -> usize {
        let failover = self.directory.failover();
        let targets: Vec<_> = failover
            .arrived_nodes()
            .into_iter()
            .filter_map(|name| self.directory.descriptor(&name))
            .collect();

        let results = join_all(targets.iter().map(|node| {
            let transport = Arc::clone(&self.transport);
            async move {
                let result = transport.call(node, NodeRequest::Ping, TimeoutClass::Ping).await;
                (node, result)
            }
        }))
        .await;

        let mut answered = 0;
        for (node, result) in results {
            match result {
                Ok(NodeResponse::Pong) => {
                    failover.record_success(&node.full_name);
                    answered += 1;
                }
                Ok(other) => {
                    tracing::warn!("Node {} answered ping with {}", node, other.type_name());
                    failover.record_failure(&node.full_name, FailureReason::Protocol);
                }
                Err(e) => {
                    tracing::debug!("Ping to {} failed: {}", node, e);
                    failover.record_failure(&node.full_name, FailureReason::Ping);
                }
            }
        }
        answered
    }

    /// Probe until stopped
    pub async fn run(&self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.subscribe();

        tracing::info!("Health probe running every {:?}", self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Health probe stopped");
    }

    /// Stop the probe loop
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FailoverController, NodeHealth};
    use crate::testing::MemoryCluster;

    #[tokio::test]
    async fn test_probe_marks_silent_node_dead() {
        let cluster = Arc::new(MemoryCluster::new(["a:1", "b:1"]));
        let failover = Arc::new(FailoverController::new(["a:1", "b:1"], 2, Duration::from_millis(5)));
        let directory = Arc::new(NodeDirectory::new(["a:1", "b:1"], Arc::clone(&failover)).unwrap());
        let probe = HealthProbe::new(directory, cluster.clone(), Duration::from_millis(10));

        cluster.set_down("b:1", true);
        assert_eq!(probe.probe_once().await, 1);
        assert_eq!(failover.health("b:1"), Some(NodeHealth::Arrived));
        probe.probe_once().await;
        assert_eq!(failover.health("b:1"), Some(NodeHealth::Dead));

        // dead nodes are no longer probed
        cluster.set_down("b:1", false);
        assert_eq!(probe.probe_once().await, 1);
        assert_eq!(failover.health("b:1"), Some(NodeHealth::Dead));
    }

    #[tokio::test]
    async fn test_run_stops() {
        let cluster = Arc::new(MemoryCluster::new(["a:1"]));
        let failover = Arc::new(FailoverController::new(["a:1"], 3, Duration::from_millis(5)));
        let directory = Arc::new(NodeDirectory::new(["a:1"], failover).unwrap());
        let probe = Arc::new(HealthProbe::new(directory, cluster, Duration::from_millis(5)));

        let running = {
            let probe = Arc::clone(&probe);
            tokio::spawn(async move { probe.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        probe.stop();
        running.await.unwrap();
    }
}
