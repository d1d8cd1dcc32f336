//! In-memory data nodes for coordinator tests

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::network::{NodeRequest, NodeResponse, NodeTransport, StoredValue, TimeoutClass};
use crate::state::NodeDescriptor;
use crate::version::VersionStamp;

#[derive(Default)]
struct MemoryNode {
    data: HashMap<Vec<u8>, StoredValue>,
    tags: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    locks: HashMap<Vec<u8>, String>,
    down: bool,
    reject: Option<String>,
    delay: Option<Duration>,
    requests: Vec<NodeRequest>,
    casts: usize,
}

impl MemoryNode {
    fn apply(&mut self, request: NodeRequest) -> NodeResponse {
        if let Some(reason) = &self.reject {
            if is_write(&request) {
                return NodeResponse::Rejected { reason: reason.clone() };
            }
        }

        match request {
            NodeRequest::Set { key, value, version, .. } => {
                self.data.insert(key, StoredValue { value, version });
                NodeResponse::Stored
            }
            NodeRequest::SetIfAbsent { key, value, version, .. } => {
                if self.data.contains_key(&key) {
                    return NodeResponse::Rejected {
                        reason: "data has already been registered".into(),
                    };
                }
                self.data.insert(key, StoredValue { value, version });
                NodeResponse::Stored
            }
            NodeRequest::SetIfVersion { key, value, version, expected, .. } => {
                let current = self.data.get(&key).map(|v| v.version).unwrap_or(VersionStamp::ABSENT);
                if current != expected {
                    return NodeResponse::Rejected {
                        reason: "data has already been updated".into(),
                    };
                }
                self.data.insert(key, StoredValue { value, version });
                NodeResponse::Stored
            }
            NodeRequest::Remove { key, .. } => NodeResponse::Removed(self.data.remove(&key)),
            NodeRequest::AppendTagKey { tag, key, .. } => {
                let keys = self.tags.entry(tag).or_default();
                if !keys.contains(&key) {
                    keys.push(key);
                }
                NodeResponse::Stored
            }
            NodeRequest::RemoveTagKey { tag, key, .. } => match self.tags.get_mut(&tag) {
                Some(keys) if keys.contains(&key) => {
                    keys.retain(|k| k != &key);
                    NodeResponse::Stored
                }
                _ => NodeResponse::NotFound,
            },
            NodeRequest::Calc { key, delta, version, .. } => {
                let Some(stored) = self.data.get_mut(&key) else {
                    return NodeResponse::NotFound;
                };
                let current = match std::str::from_utf8(&stored.value).ok().and_then(|s| s.parse::<i64>().ok()) {
                    Some(n) => n,
                    None => {
                        return NodeResponse::Rejected {
                            reason: "value is not a number".into(),
                        }
                    }
                };
                let result = current.saturating_add(delta);
                stored.value = result.to_string().into_bytes();
                stored.version = version;
                NodeResponse::Calculated(result)
            }
            NodeRequest::GetScript { key, script } => match self.data.get(&key) {
                Some(stored) => run_script(&script, stored, None),
                None => NodeResponse::NotFound,
            },
            NodeRequest::GetScriptForUpdate { key, script, version, .. } => match self.data.get_mut(&key) {
                Some(stored) => {
                    let response = run_script(&script, stored, Some(version));
                    match &response {
                        NodeResponse::Value(updated) if script.starts_with("set:") => *stored = updated.clone(),
                        _ => {}
                    }
                    response
                }
                None => NodeResponse::NotFound,
            },
            NodeRequest::Get { key } => match self.data.get(&key) {
                Some(value) => NodeResponse::Value(value.clone()),
                None => NodeResponse::NotFound,
            },
            NodeRequest::GetTagKeys { tag } => match self.tags.get(&tag) {
                Some(keys) if !keys.is_empty() => NodeResponse::Keys(keys.clone()),
                _ => NodeResponse::NotFound,
            },
            NodeRequest::Lock { key, transaction, .. } => match self.locks.get(&key) {
                Some(owner) if owner != &transaction => NodeResponse::Rejected {
                    reason: "locked by another transaction".into(),
                },
                _ => {
                    self.locks.insert(key, transaction);
                    NodeResponse::LockGranted
                }
            },
            NodeRequest::Unlock { key, transaction } => match self.locks.get(&key) {
                Some(owner) if owner == &transaction => {
                    self.locks.remove(&key);
                    NodeResponse::LockReleased
                }
                _ => NodeResponse::Rejected {
                    reason: "lock not held".into(),
                },
            },
            NodeRequest::LockOwner { key } => NodeResponse::LockHolder(self.locks.get(&key).cloned()),
            NodeRequest::Ping => NodeResponse::Pong,
        }
    }
}

/// Test script language: `upper` returns the value uppercased, `set:<v>`
/// replaces it when run for update, anything else is a script error
fn run_script(script: &str, stored: &StoredValue, update: Option<VersionStamp>) -> NodeResponse {
    if script == "upper" {
        return NodeResponse::Value(StoredValue {
            value: stored.value.to_ascii_uppercase(),
            version: stored.version,
        });
    }
    match (script.strip_prefix("set:"), update) {
        (Some(value), Some(version)) => NodeResponse::Value(StoredValue {
            value: value.as_bytes().to_vec(),
            version,
        }),
        (Some(_), None) => NodeResponse::Value(stored.clone()),
        (None, _) => NodeResponse::Rejected {
            reason: "script error".into(),
        },
    }
}

fn is_write(request: &NodeRequest) -> bool {
    matches!(
        request,
        NodeRequest::Set { .. }
            | NodeRequest::SetIfAbsent { .. }
            | NodeRequest::SetIfVersion { .. }
            | NodeRequest::Remove { .. }
            | NodeRequest::AppendTagKey { .. }
            | NodeRequest::RemoveTagKey { .. }
            | NodeRequest::Calc { .. }
            | NodeRequest::GetScriptForUpdate { .. }
    )
}

/// A set of in-memory nodes reachable through `NodeTransport`
pub struct MemoryCluster {
    nodes: Mutex<HashMap<String, MemoryNode>>,
}

impl MemoryCluster {
    pub fn new<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let nodes = names
            .into_iter()
            .map(|name| (name.to_string(), MemoryNode::default()))
            .collect();
        Self { nodes: Mutex::new(nodes) }
    }

    fn with_node<T>(&self, name: &str, f: impl FnOnce(&mut MemoryNode) -> T) -> T {
        let mut nodes = self.nodes.lock().unwrap();
        f(nodes.get_mut(name).unwrap_or_else(|| panic!("unknown node {}", name)))
    }

    /// Make a node refuse connections
    pub fn set_down(&self, name: &str, down: bool) {
        self.with_node(name, |node| node.down = down);
    }

    /// Make a node reject every write with `reason`
    pub fn reject_writes(&self, name: &str, reason: Option<&str>) {
        self.with_node(name, |node| node.reject = reason.map(str::to_string));
    }

    /// Delay every answer from a node
    pub fn set_delay(&self, name: &str, delay: Option<Duration>) {
        self.with_node(name, |node| node.delay = delay);
    }

    /// Seed a value directly
    pub fn put(&self, name: &str, key: &[u8], value: &[u8], version: i64) {
        self.with_node(name, |node| {
            node.data.insert(
                key.to_vec(),
                StoredValue {
                    value: value.to_vec(),
                    version: VersionStamp::from_raw(version),
                },
            )
        });
    }

    /// Seed a tag entry directly
    pub fn put_tag(&self, name: &str, tag: &[u8], key: &[u8]) {
        self.with_node(name, |node| node.tags.entry(tag.to_vec()).or_default().push(key.to_vec()));
    }

    /// Value stored on a node
    pub fn stored(&self, name: &str, key: &[u8]) -> Option<StoredValue> {
        self.with_node(name, |node| node.data.get(key).cloned())
    }

    /// Keys stored under a tag on a node
    pub fn tag_keys(&self, name: &str, tag: &[u8]) -> Vec<Vec<u8>> {
        self.with_node(name, |node| node.tags.get(tag).cloned().unwrap_or_default())
    }

    /// Lock owner recorded on a node
    pub fn lock_owner(&self, name: &str, key: &[u8]) -> Option<String> {
        self.with_node(name, |node| node.locks.get(key).cloned())
    }

    /// Every request a node received, calls and casts alike
    pub fn requests(&self, name: &str) -> Vec<NodeRequest> {
        self.with_node(name, |node| node.requests.clone())
    }

    /// Number of fire-and-forget requests a node received
    pub fn casts(&self, name: &str) -> usize {
        self.with_node(name, |node| node.casts)
    }

    async fn deliver(&self, node: &NodeDescriptor, request: NodeRequest, cast: bool) -> Result<NodeResponse> {
        let delay = self.with_node(&node.full_name, |n| n.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_node(&node.full_name, |n| {
            if n.down {
                return Err(Error::ConnectionFailed {
                    address: node.full_name.clone(),
                    reason: "connection refused".into(),
                });
            }
            n.requests.push(request.clone());
            if cast {
                n.casts += 1;
            }
            Ok(n.apply(request))
        })
    }
}

#[async_trait]
impl NodeTransport for MemoryCluster {
    async fn call(&self, node: &NodeDescriptor, request: NodeRequest, _class: TimeoutClass) -> Result<NodeResponse> {
        self.deliver(node, request, false).await
    }

    async fn cast(&self, node: &NodeDescriptor, request: NodeRequest) -> Result<()> {
        self.deliver(node, request, true).await.map(|_| ())
    }
}
