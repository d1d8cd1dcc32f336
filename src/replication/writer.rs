//! Replica Write Coordinator
//!
//! Fans a write out to the replica roles of a key. Primary and secondary are
//! written concurrently; the tertiary is written synchronously only when one
//! of them could not be reached, and fire-and-forget otherwise.

use std::sync::Arc;

use futures::future::join_all;

use super::attempt::AttemptPlan;
use super::reader::ReplicaReader;
use crate::dispatch::{KeyDispatcher, Replica, ReplicaSet, Role};
use crate::error::{Error, Result};
use crate::lock::LockCoordinator;
use crate::network::{NodeRequest, NodeResponse, NodeTransport, StoredValue, TimeoutClass};
use crate::state::{FailoverController, FailureReason};
use crate::version::VersionStamp;

/// Rejection text for a write-once key that already exists
pub const ALREADY_REGISTERED: &str = "data has already been registered";

/// Rejection text for a version-checked write against a newer stamp
pub const ALREADY_UPDATED: &str = "data has already been updated";

/// Outcome of one replica write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The node applied the request and answered
    Acked(NodeResponse),
    /// Sent without reading an answer
    Sent,
    /// The node answered with a refusal
    Rejected(String),
    /// The node could not be reached
    NetworkError(String),
    /// The node is paused or dead
    Unavailable,
}

impl WriteOutcome {
    fn reached(&self) -> bool {
        matches!(self, WriteOutcome::Acked(_) | WriteOutcome::Sent | WriteOutcome::Rejected(_))
    }
}

/// Per-replica result of a write
#[derive(Debug, Clone)]
pub struct ReplicaWriteResult {
    pub role: Role,
    pub node: String,
    pub outcome: WriteOutcome,
}

impl ReplicaWriteResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, WriteOutcome::Acked(_))
    }
}

/// Every replica result of one write
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub results: Vec<ReplicaWriteResult>,
}

impl WriteReport {
    /// At least one replica acknowledged the write
    pub fn succeeded(&self) -> bool {
        self.results.iter().any(ReplicaWriteResult::succeeded)
    }

    pub fn result(&self, role: Role) -> Option<&ReplicaWriteResult> {
        self.results.iter().find(|r| r.role == role)
    }

    /// First acknowledged response in role order
    pub fn first_ack(&self) -> Option<&NodeResponse> {
        self.results.iter().find_map(|r| match &r.outcome {
            WriteOutcome::Acked(response) => Some(response),
            _ => None,
        })
    }

    /// Turn the report into the overall outcome of the write
    fn into_result(self, key: &[u8]) -> Result<Self> {
        if self.succeeded() {
            return Ok(self);
        }

        let rejection = self
            .result(Role::Primary)
            .into_iter()
            .chain(self.results.iter())
            .find_map(|r| match &r.outcome {
                WriteOutcome::Rejected(reason) => Some(reason.clone()),
                _ => None,
            });
        if let Some(reason) = rejection {
            return Err(Error::Rejected(reason));
        }

        if !self.results.is_empty() && self.results.iter().all(|r| r.outcome == WriteOutcome::Unavailable) {
            let nodes: Vec<&str> = self.results.iter().map(|r| r.node.as_str()).collect();
            return Err(Error::NodeUnavailable(nodes.join(", ")));
        }

        Err(Error::NoReplicaReachable {
            key: String::from_utf8_lossy(key).into_owned(),
            attempted: self.results.iter().filter(|r| r.outcome != WriteOutcome::Unavailable).count(),
        })
    }
}

/// Replicates writes across the replica roles of a key
pub struct ReplicaWriteCoordinator {
    dispatcher: Arc<KeyDispatcher>,
    transport: Arc<dyn NodeTransport>,
    failover: Arc<FailoverController>,
    locks: Arc<LockCoordinator>,
    reader: Arc<ReplicaReader>,
}

impl ReplicaWriteCoordinator {
    pub fn new(
        dispatcher: Arc<KeyDispatcher>,
        transport: Arc<dyn NodeTransport>,
        failover: Arc<FailoverController>,
        locks: Arc<LockCoordinator>,
        reader: Arc<ReplicaReader>,
    ) -> Self {
        Self {
            dispatcher,
            transport,
            failover,
            locks,
            reader,
        }
    }

    /// Unconditional write of `value` under the current rule
    pub async fn write(
        &self,
        key: &[u8],
        value: Vec<u8>,
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<WriteReport> {
        self.locks.gate(key, transaction).await?;
        let set = self.dispatcher.resolve_write(key);
        let request = NodeRequest::Set {
            key: key.to_vec(),
            value,
            version,
            transaction: transaction.map(str::to_string),
        };
        self.replicate(&set, request).await.into_result(key)
    }

    /// Add `key` to the key list of `tag`; the tag is replicated like a key
    pub async fn write_tag(
        &self,
        tag: &[u8],
        key: &[u8],
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<WriteReport> {
        self.locks.gate(tag, transaction).await?;
        let set = self.dispatcher.resolve_write(tag);
        let request = NodeRequest::AppendTagKey {
            tag: tag.to_vec(),
            key: key.to_vec(),
            version,
            transaction: transaction.map(str::to_string),
        };
        self.replicate(&set, request).await.into_result(tag)
    }

    /// Create-only write. Refused when the key exists under any older rule
    /// or on the first reachable replica of the current one.
    pub async fn write_once(
        &self,
        key: &[u8],
        value: Vec<u8>,
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<WriteReport> {
        self.locks.gate(key, transaction).await?;

        // Best effort: a concurrent writer may still slip in between the
        // check and the conditional insert
        for index in 1..self.dispatcher.generations() {
            if self.reader.read_generation(key, index).await?.found() {
                return Err(Error::Rejected(ALREADY_REGISTERED.into()));
            }
        }

        let request = NodeRequest::SetIfAbsent {
            key: key.to_vec(),
            value,
            version,
            transaction: transaction.map(str::to_string),
        };
        self.write_conditional(key, request).await
    }

    /// Version-checked write; succeeds only if the stored stamp equals
    /// `expected` on the first reachable replica
    pub async fn compare_and_set(
        &self,
        key: &[u8],
        value: Vec<u8>,
        expected: VersionStamp,
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<WriteReport> {
        self.locks.gate(key, transaction).await?;
        let request = NodeRequest::SetIfVersion {
            key: key.to_vec(),
            value,
            version,
            expected,
            transaction: transaction.map(str::to_string),
        };
        self.write_conditional(key, request).await
    }

    /// Remove `key` under the current and every older rule. Returns the
    /// removed value, if any generation still held one.
    pub async fn remove(&self, key: &[u8], transaction: Option<&str>) -> Result<Option<StoredValue>> {
        self.locks.gate(key, transaction).await?;
        let request = NodeRequest::Remove {
            key: key.to_vec(),
            transaction: transaction.map(str::to_string),
        };

        let reports = self.across_generations(key, request).await?;
        Ok(reports.iter().find_map(|report| {
            report.results.iter().find_map(|r| match &r.outcome {
                WriteOutcome::Acked(NodeResponse::Removed(Some(value))) => Some(value.clone()),
                _ => None,
            })
        }))
    }

    /// Drop `key` from the key list of `tag` under every rule. Returns
    /// whether any list contained it.
    pub async fn remove_tag_key(&self, tag: &[u8], key: &[u8], transaction: Option<&str>) -> Result<bool> {
        self.locks.gate(tag, transaction).await?;
        let request = NodeRequest::RemoveTagKey {
            tag: tag.to_vec(),
            key: key.to_vec(),
            transaction: transaction.map(str::to_string),
        };

        let reports = self.across_generations(tag, request).await?;
        Ok(reports
            .iter()
            .any(|report| report.first_ack().map(|r| *r == NodeResponse::Stored).unwrap_or(false)))
    }

    /// Add `delta` to a numeric value. Nodes are tried in role order with the
    /// long timeout; the result is then written to the replicas after the
    /// node that computed it. Every replica ends up with the same stamp.
    /// `None` when the key does not exist.
    pub async fn calculate(
        &self,
        key: &[u8],
        delta: i64,
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<Option<i64>> {
        self.locks.gate(key, transaction).await?;
        let set = self.dispatcher.resolve_write(key);
        let request = NodeRequest::Calc {
            key: key.to_vec(),
            delta,
            version,
            transaction: transaction.map(str::to_string),
        };

        let answered = AttemptPlan::role_order()
            .run(&set, &self.failover, key, |node| {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move {
                    let response = transport.call(&node, request, TimeoutClass::Long).await?;
                    match response {
                        NodeResponse::Calculated(n) => Ok(Some(n)),
                        NodeResponse::NotFound => Ok(None),
                        NodeResponse::Rejected { reason } => Err(Error::Rejected(reason)),
                        other => Err(unexpected(&node.full_name, "Calc", &other)),
                    }
                }
            })
            .await?;

        let Some(result) = answered.value else {
            return Ok(None);
        };

        let followers: Vec<&Replica> = set.replicas().iter().filter(|r| r.role > answered.role).collect();
        let update = NodeRequest::Set {
            key: key.to_vec(),
            value: result.to_string().into_bytes(),
            version,
            transaction: transaction.map(str::to_string),
        };
        join_all(followers.into_iter().map(|replica| self.send(replica, update.clone()))).await;

        Ok(Some(result))
    }

    /// Run a script that may modify the value on every eligible replica of
    /// `key`, walking older rules while the key is not found. Returns the
    /// result of the primary-most replica that has the key.
    pub async fn script_for_update(
        &self,
        key: &[u8],
        script: &str,
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<Option<StoredValue>> {
        self.locks.gate(key, transaction).await?;
        let request = NodeRequest::GetScriptForUpdate {
            key: key.to_vec(),
            script: script.to_string(),
            version,
            transaction: transaction.map(str::to_string),
        };

        let mut answered = false;
        let mut last_error = None;
        for index in 0..self.dispatcher.generations() {
            let Some(set) = self.dispatcher.resolve(key, false, index) else {
                break;
            };
            let mut results = join_all(set.replicas().iter().map(|replica| self.send(replica, request.clone()))).await;
            results.extend(set.excluded().iter().map(|replica| unavailable(&set, replica.role)));
            results.sort_by_key(|r| r.role);

            match (WriteReport { results }).into_result(key) {
                Ok(report) => {
                    let found = report.results.iter().find_map(|r| match &r.outcome {
                        WriteOutcome::Acked(NodeResponse::Value(value)) => Some(value.clone()),
                        _ => None,
                    });
                    if found.is_some() {
                        return Ok(found);
                    }
                    answered = true;
                }
                Err(e @ Error::Rejected(_)) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(None),
        }
    }

    /// Conditional write on the first reachable replica in role order, then
    /// the plain value on every replica after it
    async fn write_conditional(&self, key: &[u8], request: NodeRequest) -> Result<WriteReport> {
        let set = self.dispatcher.resolve_write(key);
        let name = request.type_name();

        let answered = AttemptPlan::role_order()
            .run(&set, &self.failover, key, |node| {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move {
                    match transport.call(&node, request, TimeoutClass::Standard).await? {
                        NodeResponse::Stored => Ok(NodeResponse::Stored),
                        NodeResponse::Rejected { reason } => Err(Error::Rejected(reason)),
                        other => Err(unexpected(&node.full_name, name, &other)),
                    }
                }
            })
            .await?;

        let mut report = WriteReport {
            results: vec![ReplicaWriteResult {
                role: answered.role,
                node: answered.node.full_name.clone(),
                outcome: WriteOutcome::Acked(answered.value),
            }],
        };

        let update = request.unconditional();
        let followers = set.replicas().iter().filter(|r| r.role > answered.role);
        let results = join_all(followers.map(|replica| self.send(replica, update.clone()))).await;
        report.results.extend(results);

        Ok(report)
    }

    /// Apply `request` under every rule generation; succeeds if any did
    async fn across_generations(&self, key: &[u8], request: NodeRequest) -> Result<Vec<WriteReport>> {
        let mut reports = Vec::new();
        let mut last_error = None;

        for index in 0..self.dispatcher.generations() {
            let Some(set) = self.dispatcher.resolve(key, false, index) else {
                break;
            };
            match self.replicate(&set, request.clone()).await.into_result(key) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::debug!(
                        "{} on generation {} failed for {}: {}",
                        request.type_name(),
                        set.generation(),
                        String::from_utf8_lossy(key),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match (reports.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(reports),
        }
    }

    /// The replication algorithm shared by key and tag writes
    pub async fn replicate(&self, set: &ReplicaSet, request: NodeRequest) -> WriteReport {
        let (primary, secondary) = tokio::join!(
            self.send_role(set, Role::Primary, request.clone()),
            self.send_role(set, Role::Secondary, request.clone()),
        );

        let mut report = WriteReport::default();
        let mut degraded = false;
        for result in [primary, secondary].into_iter().flatten() {
            degraded |= !result.outcome.reached();
            report.results.push(result);
        }

        if set.has_role(Role::Tertiary) {
            let tertiary = match set.role(Role::Tertiary) {
                Some(replica) if degraded => self.send(replica, request).await,
                Some(replica) => self.cast(replica, request).await,
                None => unavailable(set, Role::Tertiary),
            };
            report.results.push(tertiary);
        }

        report
    }

    async fn send_role(&self, set: &ReplicaSet, role: Role, request: NodeRequest) -> Option<ReplicaWriteResult> {
        if !set.has_role(role) {
            return None;
        }
        Some(match set.role(role) {
            Some(replica) => self.send(replica, request).await,
            None => unavailable(set, role),
        })
    }

    /// Synchronous write to one replica
    async fn send(&self, replica: &Replica, request: NodeRequest) -> ReplicaWriteResult {
        let name = &replica.node.full_name;
        let outcome = match self.failover.acquire(name) {
            None => WriteOutcome::Unavailable,
            Some(_lease) => match self.transport.call(&replica.node, request, TimeoutClass::Standard).await {
                Ok(NodeResponse::Rejected { reason }) => {
                    self.failover.record_success(name);
                    WriteOutcome::Rejected(reason)
                }
                Ok(response) => {
                    self.failover.record_success(name);
                    WriteOutcome::Acked(response)
                }
                Err(e) => self.failed(name, e),
            },
        };

        ReplicaWriteResult {
            role: replica.role,
            node: name.clone(),
            outcome,
        }
    }

    /// Fire-and-forget write to one replica
    async fn cast(&self, replica: &Replica, request: NodeRequest) -> ReplicaWriteResult {
        let name = &replica.node.full_name;
        let outcome = match self.failover.acquire(name) {
            None => WriteOutcome::Unavailable,
            Some(_lease) => match self.transport.cast(&replica.node, request).await {
                Ok(()) => WriteOutcome::Sent,
                Err(e) => self.failed(name, e),
            },
        };

        ReplicaWriteResult {
            role: replica.role,
            node: name.clone(),
            outcome,
        }
    }

    fn failed(&self, name: &str, error: Error) -> WriteOutcome {
        if error.is_network() {
            self.failover.record_failure(name, FailureReason::from_error(&error));
        }
        tracing::warn!("Write to {} failed: {}", name, error);
        WriteOutcome::NetworkError(error.to_string())
    }
}

fn unavailable(set: &ReplicaSet, role: Role) -> ReplicaWriteResult {
    let node = set
        .excluded()
        .iter()
        .find(|r| r.role == role)
        .map(|r| r.node.full_name.clone())
        .unwrap_or_default();
    ReplicaWriteResult {
        role,
        node,
        outcome: WriteOutcome::Unavailable,
    }
}

fn unexpected(node: &str, operation: &str, response: &NodeResponse) -> Error {
    tracing::error!("Unexpected answer from {} to {}: {:?}", node, operation, response);
    Error::UnexpectedResponse {
        node: node.to_string(),
        detail: format!("{} answered {}", operation, response.type_name()),
    }
}
