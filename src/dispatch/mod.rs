//! Key Dispatch
//!
//! Maps a key or tag onto the ordered replica nodes that own it, under the
//! current placement rule or any historical one. Writes only ever use the
//! current rule; reads, removals and locks walk older generations to find
//! data written before a topology change.

mod rule;

pub use rule::{HashAlgorithm, PlacementRule, ReplicaGroup, Role, VIRTUAL_NODES};

use std::sync::Arc;

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::state::{FailoverController, NodeDescriptor, NodeDirectory};

/// A node assigned to a key, with its role
#[derive(Debug, Clone)]
pub struct Replica {
    pub role: Role,
    pub node: Arc<NodeDescriptor>,
}

/// Replica nodes for one key under one rule generation
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    generation: u64,
    /// Eligible replicas in dispatch order
    replicas: Vec<Replica>,
    /// Configured replicas skipped because their node is not eligible
    excluded: Vec<Replica>,
}

impl ReplicaSet {
    /// Rule generation this set came from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Eligible replicas in dispatch order
    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// Replicas skipped because their node is paused or dead
    pub fn excluded(&self) -> &[Replica] {
        &self.excluded
    }

    /// Eligible replica holding `role`
    pub fn role(&self, role: Role) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.role == role)
    }

    /// Whether `role` is configured for this key, eligible or not
    pub fn has_role(&self, role: Role) -> bool {
        self.replicas.iter().chain(self.excluded.iter()).any(|r| r.role == role)
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }
}

/// Resolves keys to replica sets across rule generations
pub struct KeyDispatcher {
    /// Newest generation first
    rules: Vec<PlacementRule>,
    failover: Arc<FailoverController>,
}

impl KeyDispatcher {
    /// Create a dispatcher; rules may be given in any order
    pub fn new(mut rules: Vec<PlacementRule>, failover: Arc<FailoverController>) -> Result<Self> {
        if rules.is_empty() {
            return Err(Error::Config("at least one placement rule is required".into()));
        }
        rules.sort_by(|a, b| b.generation().cmp(&a.generation()));
        Ok(Self { rules, failover })
    }

    /// Build every configured rule against the node directory
    pub fn from_config(config: &MasterConfig, directory: &NodeDirectory) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                PlacementRule::from_config(rule, |address| {
                    directory
                        .descriptor(address)
                        .ok_or_else(|| Error::NodeNotFound(address.to_string()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(rules, Arc::clone(directory.failover()))
    }

    /// Number of rule generations, current included
    pub fn generations(&self) -> usize {
        self.rules.len()
    }

    /// Rules, newest first
    pub fn rules(&self) -> &[PlacementRule] {
        &self.rules
    }

    /// Resolve `key` under the rule `rule_index` generations back from the
    /// current one. Returns `None` once generations are exhausted.
    ///
    /// `prefer_secondary` swaps primary and secondary in the returned order;
    /// roles are unchanged.
    pub fn resolve(&self, key: &[u8], prefer_secondary: bool, rule_index: usize) -> Option<ReplicaSet> {
        let rule = self.rules.get(rule_index)?;
        let group = rule.group_for(key);

        let mut members = group.members();
        if prefer_secondary && members.len() > 1 {
            members.swap(0, 1);
        }

        let mut replicas = Vec::with_capacity(members.len());
        let mut excluded = Vec::new();
        for (role, node) in members {
            let replica = Replica { role, node };
            if self.failover.is_eligible(&replica.node.full_name) {
                replicas.push(replica);
            } else {
                excluded.push(replica);
            }
        }

        Some(ReplicaSet {
            generation: rule.generation(),
            replicas,
            excluded,
        })
    }

    /// Replica set for a fresh write: always the current rule
    pub fn resolve_write(&self, key: &[u8]) -> ReplicaSet {
        // rules is never empty
        self.resolve(key, false, 0).unwrap_or(ReplicaSet {
            generation: 0,
            replicas: Vec::new(),
            excluded: Vec::new(),
        })
    }

    /// Replica sets under every older generation, newest first
    pub fn historical<'a>(
        &'a self,
        key: &'a [u8],
        prefer_secondary: bool,
    ) -> impl Iterator<Item = ReplicaSet> + 'a {
        (1..).map_while(move |index| self.resolve(key, prefer_secondary, index))
    }
}
