//! Node Directory
//!
//! Resolves a node identifier (`host:port`) to its connection parameters and
//! current health.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::failover::{FailoverController, NodeHealth};
use crate::error::{Error, Result};

/// Connection parameters of one data node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Host name or IP
    pub name: String,
    /// TCP port
    pub port: u16,
    /// `name:port`, the node's identity everywhere else
    pub full_name: String,
}

impl NodeDescriptor {
    /// Parse `host:port`
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("invalid node address '{}'", address)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port in node address '{}'", address)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("empty host in node address '{}'", address)));
        }
        Ok(Self {
            name: host.to_string(),
            port,
            full_name: address.to_string(),
        })
    }

    /// Address to connect to
    pub fn address(&self) -> &str {
        &self.full_name
    }
}

impl std::fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// Directory lookup result
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub descriptor: Arc<NodeDescriptor>,
    pub health: NodeHealth,
    pub recovering: bool,
}

/// All data nodes known to this master
pub struct NodeDirectory {
    nodes: HashMap<String, Arc<NodeDescriptor>>,
    failover: Arc<FailoverController>,
}

impl NodeDirectory {
    /// Build a directory from node addresses; every address must also be
    /// tracked by `failover`
    pub fn new<'a, I>(addresses: I, failover: Arc<FailoverController>) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut nodes = HashMap::new();
        for address in addresses {
            if !failover.contains(address) {
                return Err(Error::Config(format!(
                    "node {} has no health slot",
                    address
                )));
            }
            let descriptor = NodeDescriptor::parse(address)?;
            nodes.insert(descriptor.full_name.clone(), Arc::new(descriptor));
        }
        Ok(Self { nodes, failover })
    }

    /// Connection parameters for a node
    pub fn descriptor(&self, name: &str) -> Option<Arc<NodeDescriptor>> {
        self.nodes.get(name).cloned()
    }

    /// Connection parameters plus current health
    pub fn lookup(&self, name: &str) -> Option<NodeEntry> {
        let descriptor = self.nodes.get(name)?;
        let report = self.failover.report(name)?;
        Some(NodeEntry {
            descriptor: Arc::clone(descriptor),
            health: report.health,
            recovering: report.recovering,
        })
    }

    /// Shared health registry
    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    /// All node names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    /// All descriptors
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<NodeDescriptor>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_descriptor() {
        let node = NodeDescriptor::parse("10.0.0.1:5553").unwrap();
        assert_eq!(node.name, "10.0.0.1");
        assert_eq!(node.port, 5553);
        assert_eq!(node.full_name, "10.0.0.1:5553");

        assert!(NodeDescriptor::parse("10.0.0.1").is_err());
        assert!(NodeDescriptor::parse(":5553").is_err());
        assert!(NodeDescriptor::parse("host:notaport").is_err());
    }

    #[test]
    fn test_lookup_reflects_health() {
        let failover = Arc::new(FailoverController::new(
            ["a:1", "b:2"],
            3,
            Duration::from_millis(10),
        ));
        let directory = NodeDirectory::new(["a:1", "b:2"], Arc::clone(&failover)).unwrap();

        assert_eq!(directory.lookup("a:1").unwrap().health, NodeHealth::Arrived);
        failover.mark_dead("a:1").unwrap();
        assert_eq!(directory.lookup("a:1").unwrap().health, NodeHealth::Dead);
        assert!(directory.lookup("c:3").is_none());
        assert_eq!(directory.names(), vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[test]
    fn test_rejects_untracked_node() {
        let failover = Arc::new(FailoverController::new(["a:1"], 3, Duration::from_millis(10)));
        assert!(NodeDirectory::new(["a:1", "b:2"], failover).is_err());
    }
}
