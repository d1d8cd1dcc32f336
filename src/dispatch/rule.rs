//! Placement Rules
//!
//! A rule generation maps every key onto exactly one replica group, either by
//! simple modulo over the group list or through a consistent-hash ring.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;
use crate::error::{Error, Result};
use crate::state::NodeDescriptor;

/// Virtual points per group on the consistent-hash ring
pub const VIRTUAL_NODES: usize = 50;

/// Hash assignment within one rule generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// `hash(key) % groups`
    #[default]
    Modulo,
    /// Ring with `VIRTUAL_NODES` points per group
    ConsistentHash,
}

/// Replica role of a node for a given key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Secondary,
    Tertiary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
            Role::Tertiary => write!(f, "tertiary"),
        }
    }
}

/// Up to three nodes that hold the same keys
#[derive(Debug, Clone)]
pub struct ReplicaGroup {
    pub primary: Arc<NodeDescriptor>,
    pub secondary: Option<Arc<NodeDescriptor>>,
    pub tertiary: Option<Arc<NodeDescriptor>>,
}

impl ReplicaGroup {
    /// Members in role order
    pub fn members(&self) -> Vec<(Role, Arc<NodeDescriptor>)> {
        let mut members = vec![(Role::Primary, Arc::clone(&self.primary))];
        if let Some(node) = &self.secondary {
            members.push((Role::Secondary, Arc::clone(node)));
        }
        if let Some(node) = &self.tertiary {
            members.push((Role::Tertiary, Arc::clone(node)));
        }
        members
    }
}

/// Consistent-hash ring over group indexes
#[derive(Debug, Clone)]
struct HashRing {
    points: BTreeMap<u32, usize>,
}

impl HashRing {
    fn build(groups: &[ReplicaGroup]) -> Self {
        let mut points = BTreeMap::new();
        for (index, group) in groups.iter().enumerate() {
            for replica in 0..VIRTUAL_NODES {
                let point = crc32fast::hash(format!("{}_{}", group.primary.full_name, replica).as_bytes());
                // First group to claim a point keeps it
                points.entry(point).or_insert(index);
            }
        }
        Self { points }
    }

    fn locate(&self, hash: u32) -> usize {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, index)| *index)
            .unwrap_or(0)
    }
}

/// One generation of key placement
#[derive(Debug, Clone)]
pub struct PlacementRule {
    generation: u64,
    algorithm: HashAlgorithm,
    groups: Vec<ReplicaGroup>,
    ring: Option<HashRing>,
}

impl PlacementRule {
    /// Create a rule; `groups` must be non-empty
    pub fn new(generation: u64, algorithm: HashAlgorithm, groups: Vec<ReplicaGroup>) -> Result<Self> {
        if groups.is_empty() {
            return Err(Error::Config(format!(
                "rule generation {} has no groups",
                generation
            )));
        }
        let ring = match algorithm {
            HashAlgorithm::Modulo => None,
            HashAlgorithm::ConsistentHash => Some(HashRing::build(&groups)),
        };
        Ok(Self {
            generation,
            algorithm,
            groups,
            ring,
        })
    }

    /// Build from configuration, resolving addresses through `lookup`
    pub fn from_config<F>(config: &RuleConfig, mut lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<Arc<NodeDescriptor>>,
    {
        let mut groups = Vec::with_capacity(config.groups.len());
        for group in &config.groups {
            groups.push(ReplicaGroup {
                primary: lookup(group.primary.as_str())?,
                secondary: group.secondary.as_deref().map(&mut lookup).transpose()?,
                tertiary: group.tertiary.as_deref().map(&mut lookup).transpose()?,
            });
        }
        Self::new(config.generation, config.algorithm, groups)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn groups(&self) -> &[ReplicaGroup] {
        &self.groups
    }

    /// The group owning `key`. Pure function of the key for a fixed rule.
    pub fn group_for(&self, key: &[u8]) -> &ReplicaGroup {
        let hash = crc32fast::hash(key);
        let index = match &self.ring {
            Some(ring) => ring.locate(hash),
            None => hash as usize % self.groups.len(),
        };
        &self.groups[index]
    }
}
