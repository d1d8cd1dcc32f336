//! Replica Reads
//!
//! Reads a key from its replicas under the configured consistency mode and
//! falls back through older rule generations until the key is found.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::attempt::AttemptPlan;
use crate::consistency::{ConsistencyMode, ConsistencyResolver, ReadOutcome, ReplicaRead};
use crate::dispatch::{KeyDispatcher, ReplicaSet, Role};
use crate::error::{Error, Result};
use crate::network::{NodeRequest, NodeResponse, NodeTransport, StoredValue, TimeoutClass};
use crate::state::{FailoverController, FailureReason};

/// Reads keys and tag lists from replicas
pub struct ReplicaReader {
    dispatcher: Arc<KeyDispatcher>,
    transport: Arc<dyn NodeTransport>,
    failover: Arc<FailoverController>,
    mode: ConsistencyMode,
    /// Alternates the first replica of weak reads
    read_counter: AtomicUsize,
}

impl ReplicaReader {
    pub fn new(
        dispatcher: Arc<KeyDispatcher>,
        transport: Arc<dyn NodeTransport>,
        failover: Arc<FailoverController>,
        mode: ConsistencyMode,
    ) -> Self {
        Self {
            dispatcher,
            transport,
            failover,
            mode,
            read_counter: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    fn prefer_secondary(&self) -> bool {
        match self.mode {
            ConsistencyMode::Weak => self.read_counter.fetch_add(1, Ordering::Relaxed) % 2 == 1,
            ConsistencyMode::Medium => true,
            ConsistencyMode::Strong => false,
        }
    }

    /// Read `key`, walking older rules while it is not found.
    ///
    /// Fails only when no generation could be read at all.
    pub async fn get(&self, key: &[u8]) -> Result<ReadOutcome> {
        let prefer_secondary = self.prefer_secondary();
        let mut answered = false;
        let mut last_error = None;

        for index in 0..self.dispatcher.generations() {
            let Some(set) = self.dispatcher.resolve(key, prefer_secondary, index) else {
                break;
            };
            match self.read_set(&set, key, prefer_secondary).await {
                Ok(outcome) if outcome.found() => {
                    if index > 0 {
                        tracing::debug!(
                            "{} found under generation {}",
                            String::from_utf8_lossy(key),
                            set.generation()
                        );
                    }
                    return Ok(outcome);
                }
                Ok(_) => answered = true,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(ReadOutcome::default()),
        }
    }

    /// Read `key` under a single rule generation
    pub async fn read_generation(&self, key: &[u8], rule_index: usize) -> Result<ReadOutcome> {
        let prefer_secondary = self.prefer_secondary();
        match self.dispatcher.resolve(key, prefer_secondary, rule_index) {
            Some(set) => self.read_set(&set, key, prefer_secondary).await,
            None => Ok(ReadOutcome::default()),
        }
    }

    /// Key list stored under `tag`, with historical fallback.
    /// `None` when no generation has the tag.
    pub async fn get_tag_keys(&self, tag: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let request = NodeRequest::GetTagKeys { tag: tag.to_vec() };
        self.first_found(tag, request, |response| match response {
            NodeResponse::Keys(keys) => Ok(Some(keys)),
            NodeResponse::NotFound => Ok(None),
            other => Err(other),
        })
        .await
    }

    /// Result of a read-only script evaluated by the node owning `key`,
    /// with historical fallback. `None` when no generation has the key.
    pub async fn get_script(&self, key: &[u8], script: &str) -> Result<Option<StoredValue>> {
        let request = NodeRequest::GetScript {
            key: key.to_vec(),
            script: script.to_string(),
        };
        self.first_found(key, request, |response| match response {
            NodeResponse::Value(value) => Ok(Some(value)),
            NodeResponse::NotFound => Ok(None),
            other => Err(other),
        })
        .await
    }

    /// Single-answer read walking the fallback plan under each generation
    /// until one reports a value. A node refusal stops the walk.
    async fn first_found<T>(
        &self,
        key: &[u8],
        request: NodeRequest,
        parse: fn(NodeResponse) -> std::result::Result<Option<T>, NodeResponse>,
    ) -> Result<Option<T>> {
        let prefer_secondary = self.prefer_secondary();
        let name = request.type_name();
        let mut answered = false;
        let mut last_error = None;

        for index in 0..self.dispatcher.generations() {
            let Some(set) = self.dispatcher.resolve(key, prefer_secondary, index) else {
                break;
            };
            let result = AttemptPlan::read_fallback(prefer_secondary)
                .run(&set, &self.failover, key, |node| {
                    let transport = Arc::clone(&self.transport);
                    let request = request.clone();
                    async move {
                        match transport.call(&node, request, TimeoutClass::Standard).await? {
                            NodeResponse::Rejected { reason } => Err(Error::Rejected(reason)),
                            response => parse(response).map_err(|other| unexpected(&node.full_name, name, &other)),
                        }
                    }
                })
                .await;

            match result {
                Ok(answer) => match answer.value {
                    Some(value) => return Ok(Some(value)),
                    None => answered = true,
                },
                Err(e) if e.is_network() || matches!(e, Error::NoReplicaReachable { .. }) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(None),
        }
    }

    /// Weak and medium reads take the first replica that answers, found or
    /// not: a `NotFound` from a reachable replica is the answer for this
    /// generation and the next replica is not asked. Older generations are
    /// still consulted by the caller.
    async fn read_set(&self, set: &ReplicaSet, key: &[u8], prefer_secondary: bool) -> Result<ReadOutcome> {
        match self.mode {
            ConsistencyMode::Weak | ConsistencyMode::Medium => {
                let answer = AttemptPlan::read_fallback(prefer_secondary)
                    .run(set, &self.failover, key, |node| {
                        let transport = Arc::clone(&self.transport);
                        let key = key.to_vec();
                        async move { fetch(transport.as_ref(), &node.full_name, &node, key).await }
                    })
                    .await?;
                Ok(ReadOutcome { value: answer.value })
            }
            ConsistencyMode::Strong => self.read_strong(set, key).await,
        }
    }

    /// Ask primary and secondary concurrently; the tertiary stands in for
    /// whichever of them did not answer
    async fn read_strong(&self, set: &ReplicaSet, key: &[u8]) -> Result<ReadOutcome> {
        let (mut primary, mut secondary) = tokio::join!(
            self.read_role(set, Role::Primary, key),
            self.read_role(set, Role::Secondary, key),
        );

        if primary == ReplicaRead::Unreachable {
            primary = self.read_role(set, Role::Tertiary, key).await;
        } else if secondary == ReplicaRead::Unreachable {
            secondary = self.read_role(set, Role::Tertiary, key).await;
        }

        ConsistencyResolver::resolve(ConsistencyMode::Strong, primary, secondary).ok_or_else(|| {
            Error::NoReplicaReachable {
                key: String::from_utf8_lossy(key).into_owned(),
                attempted: set.len(),
            }
        })
    }

    async fn read_role(&self, set: &ReplicaSet, role: Role, key: &[u8]) -> ReplicaRead {
        let Some(replica) = set.role(role) else {
            return ReplicaRead::Unreachable;
        };
        let name = &replica.node.full_name;
        let Some(_lease) = self.failover.acquire(name) else {
            return ReplicaRead::Unreachable;
        };

        match fetch(self.transport.as_ref(), name, &replica.node, key.to_vec()).await {
            Ok(Some(value)) => {
                self.failover.record_success(name);
                ReplicaRead::Found(value)
            }
            Ok(None) => {
                self.failover.record_success(name);
                ReplicaRead::Missing
            }
            Err(e) => {
                if e.is_network() {
                    self.failover.record_failure(name, FailureReason::from_error(&e));
                } else {
                    self.failover.record_failure(name, FailureReason::Protocol);
                }
                ReplicaRead::Unreachable
            }
        }
    }
}

async fn fetch(
    transport: &dyn NodeTransport,
    name: &str,
    node: &crate::state::NodeDescriptor,
    key: Vec<u8>,
) -> Result<Option<StoredValue>> {
    match transport.call(node, NodeRequest::Get { key }, TimeoutClass::Standard).await? {
        NodeResponse::Value(value) => Ok(Some(value)),
        NodeResponse::NotFound => Ok(None),
        other => Err(unexpected(name, "Get", &other)),
    }
}

fn unexpected(node: &str, operation: &str, response: &NodeResponse) -> Error {
    tracing::error!("Unexpected answer from {} to {}: {:?}", node, operation, response);
    Error::UnexpectedResponse {
        node: node.to_string(),
        detail: format!("{} answered {}", operation, response.type_name()),
    }
}
