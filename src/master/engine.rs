//! Master Engine
//!
//! Executes client operations against the dispatcher, the replica
//! coordinators, the lock coordinator and the failover controller. Every
//! data-plane error is turned into a `Response`; nothing here tears down a
//! client session.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use super::request::{Operation, Payload, Request, Response};
use crate::config::{LimitsConfig, MasterConfig};
use crate::dispatch::KeyDispatcher;
use crate::error::{Error, Result};
use crate::lock::LockCoordinator;
use crate::network::NodeTransport;
use crate::replication::{ReplicaReader, ReplicaWriteCoordinator, WriteReport};
use crate::state::{FailoverController, NodeDirectory};
use crate::version::{VersionClock, VersionStamp};

/// Server version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The coordination core behind every client session
pub struct MasterEngine {
    directory: Arc<NodeDirectory>,
    failover: Arc<FailoverController>,
    dispatcher: Arc<KeyDispatcher>,
    reader: Arc<ReplicaReader>,
    writer: ReplicaWriteCoordinator,
    locks: Arc<LockCoordinator>,
    clock: VersionClock,
    limits: LimitsConfig,
    prefix: Option<Vec<u8>>,
}

impl MasterEngine {
    /// Wire up every component from configuration
    pub fn new(config: &MasterConfig, transport: Arc<dyn NodeTransport>) -> Result<Self> {
        let nodes = config.data_nodes();
        let failover = Arc::new(FailoverController::new(
            nodes.iter().cloned(),
            config.failover.failure_threshold,
            Duration::from_millis(config.failover.drain_poll_ms),
        ));
        let directory = Arc::new(NodeDirectory::new(
            nodes.iter().map(String::as_str),
            Arc::clone(&failover),
        )?);
        let dispatcher = Arc::new(KeyDispatcher::from_config(config, &directory)?);
        let locks = Arc::new(LockCoordinator::from_config(config, Arc::clone(&transport))?);
        let reader = Arc::new(ReplicaReader::new(
            Arc::clone(&dispatcher),
            Arc::clone(&transport),
            Arc::clone(&failover),
            config.dispatch.consistency,
        ));
        let writer = ReplicaWriteCoordinator::new(
            Arc::clone(&dispatcher),
            transport,
            Arc::clone(&failover),
            Arc::clone(&locks),
            Arc::clone(&reader),
        );

        tracing::info!(
            "Engine ready: {} nodes, {} rule generations, {} reads, transactions {}",
            directory.len(),
            dispatcher.generations(),
            config.dispatch.consistency,
            if locks.is_enabled() { "on" } else { "off" }
        );

        Ok(Self {
            directory,
            failover,
            dispatcher,
            reader,
            writer,
            locks,
            clock: VersionClock::for_node(&config.node.id),
            limits: config.limits.clone(),
            prefix: config
                .dispatch
                .isolation_prefix
                .as_ref()
                .filter(|p| !p.is_empty())
                .map(|p| p.as_bytes().to_vec()),
        })
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    pub fn dispatcher(&self) -> &Arc<KeyDispatcher> {
        &self.dispatcher
    }

    /// Execute one request
    pub async fn handle(&self, request: Request) -> Response {
        let name = request.operation.name();
        let code = request.operation.code();
        tracing::trace!("Executing {} ({})", name, code);

        let result = match request.timeout_hint_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), self.execute(request.operation)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Network(format!("{} did not finish within {}ms", name, ms))),
            },
            None => self.execute(request.operation).await,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} ({}) failed: {}", name, code, e);
                Response::from(e)
            }
        }
    }

    async fn execute(&self, operation: Operation) -> Result<Response> {
        match operation {
            Operation::Init => Ok(Response::ok(Payload::Integer(self.limits.max_value_length as i64))),
            Operation::Ping => Ok(Response::ok(Payload::Text("pong".into()))),
            Operation::Version => Ok(Response::ok(Payload::Text(format!("shardmaster {}", VERSION)))),
            Operation::Disconnect => Ok(Response::empty()),

            Operation::Set {
                key,
                tags,
                transaction,
                value,
            } => {
                self.check_key(&key)?;
                self.check_tags(&tags)?;
                self.check_value(&value)?;
                check_transaction(transaction.as_deref())?;
                let key = self.scoped(&key);
                let version = self.clock.next();
                let transaction = transaction.as_deref();

                self.write_tags(&tags, &key, transaction, version).await?;
                self.writer.write(&key, value, transaction, version).await?;
                Ok(stored(version))
            }

            Operation::SetOnce {
                key,
                tags,
                transaction,
                value,
            } => {
                self.check_key(&key)?;
                self.check_tags(&tags)?;
                self.check_value(&value)?;
                check_transaction(transaction.as_deref())?;
                let key = self.scoped(&key);
                let version = self.clock.next();
                let transaction = transaction.as_deref();

                self.writer.write_once(&key, value, transaction, version).await?;
                self.write_tags(&tags, &key, transaction, version).await?;
                Ok(stored(version))
            }

            Operation::SetIfVersion {
                key,
                tags,
                transaction,
                value,
                expected,
            } => {
                self.check_key(&key)?;
                self.check_tags(&tags)?;
                self.check_value(&value)?;
                check_transaction(transaction.as_deref())?;
                let key = self.scoped(&key);
                let version = self.clock.next();
                let transaction = transaction.as_deref();

                self.writer
                    .compare_and_set(&key, value, expected, transaction, version)
                    .await?;
                self.write_tags(&tags, &key, transaction, version).await?;
                Ok(stored(version))
            }

            Operation::Get { key } => {
                self.check_key(&key)?;
                let outcome = self.reader.get(&self.scoped(&key)).await?;
                Ok(match outcome.into_value() {
                    Some(stored) => Response::ok(Payload::Value(stored.value)),
                    None => Response::NotFound,
                })
            }

            Operation::GetWithVersion { key } => {
                self.check_key(&key)?;
                let outcome = self.reader.get(&self.scoped(&key)).await?;
                Ok(match outcome.into_value() {
                    Some(stored) => Response::Success {
                        payload: Payload::Value(stored.value),
                        version: Some(stored.version),
                    },
                    None => Response::NotFound,
                })
            }

            Operation::GetScript { key, script } => {
                self.check_key(&key)?;
                check_script(&script)?;
                Ok(match self.reader.get_script(&self.scoped(&key), &script).await? {
                    Some(result) => Response::ok(Payload::Value(result.value)),
                    None => Response::NotFound,
                })
            }

            Operation::GetScriptForUpdate {
                key,
                script,
                transaction,
            } => {
                self.check_key(&key)?;
                check_script(&script)?;
                check_transaction(transaction.as_deref())?;
                let version = self.clock.next();
                let result = self
                    .writer
                    .script_for_update(&self.scoped(&key), &script, transaction.as_deref(), version)
                    .await?;
                Ok(match result {
                    Some(result) => Response::ok(Payload::Value(result.value)),
                    None => Response::NotFound,
                })
            }

            Operation::MultiGet { keys } => {
                if keys.is_empty() {
                    return Err(Error::Validation("key list is empty".into()));
                }
                for key in &keys {
                    self.check_key(key)?;
                }
                let scoped: Vec<Vec<u8>> = keys.iter().map(|k| self.scoped(k)).collect();
                let entries = self.multi_get(scoped).await?;
                Ok(Response::ok(Payload::Entries(entries)))
            }

            Operation::GetTagKeys { tag, include_missing } => {
                self.check_key(&tag)?;
                match self.tag_keys(&self.scoped(&tag), include_missing).await? {
                    Some(keys) => Ok(Response::ok(Payload::Keys(
                        keys.into_iter().map(|k| self.unscoped(k)).collect(),
                    ))),
                    None => Ok(Response::NotFound),
                }
            }

            Operation::GetTagValues { tag } => {
                self.check_key(&tag)?;
                let Some(keys) = self.tag_keys(&self.scoped(&tag), false).await? else {
                    return Ok(Response::NotFound);
                };
                let entries = self.multi_get(keys).await?;
                Ok(Response::ok(Payload::Entries(entries)))
            }

            Operation::Remove { key, transaction } => {
                self.check_key(&key)?;
                check_transaction(transaction.as_deref())?;
                match self.writer.remove(&self.scoped(&key), transaction.as_deref()).await? {
                    Some(removed) => Ok(Response::ok(Payload::Value(removed.value))),
                    None => Ok(Response::NotFound),
                }
            }

            Operation::RemoveTagFromKey { tag, key, transaction } => {
                self.check_key(&tag)?;
                self.check_key(&key)?;
                check_transaction(transaction.as_deref())?;
                let removed = self
                    .writer
                    .remove_tag_key(&self.scoped(&tag), &self.scoped(&key), transaction.as_deref())
                    .await?;
                Ok(if removed { Response::empty() } else { Response::NotFound })
            }

            Operation::Increment { key, transaction, delta } => self.calculate(key, transaction, delta).await,
            Operation::Decrement { key, transaction, delta } => {
                self.calculate(key, transaction, delta.saturating_neg()).await
            }

            Operation::Lock {
                key,
                transaction,
                hold_secs,
                wait_secs,
            } => {
                self.check_key(&key)?;
                check_transaction(Some(&transaction))?;
                let granted = self
                    .locks
                    .lock(&self.scoped(&key), &transaction, hold_secs, wait_secs)
                    .await?;
                Ok(if granted {
                    Response::empty()
                } else {
                    Response::refused("lock not acquired")
                })
            }

            Operation::Unlock { key, transaction } => {
                self.check_key(&key)?;
                check_transaction(Some(&transaction))?;
                let released = self.locks.unlock(&self.scoped(&key), &transaction).await?;
                Ok(if released {
                    Response::empty()
                } else {
                    Response::refused("lock not held")
                })
            }

            Operation::LockOwner { key } => {
                self.check_key(&key)?;
                Ok(match self.locks.query_owner(&self.scoped(&key)).await? {
                    Some(owner) => Response::ok(Payload::Text(owner)),
                    None => Response::NotFound,
                })
            }

            Operation::StartTransaction => {
                if !self.locks.is_enabled() {
                    return Err(Error::TransactionDisabled);
                }
                Ok(Response::ok(Payload::Text(uuid::Uuid::new_v4().to_string())))
            }

            Operation::NodeStatus { node } => Ok(match self.failover.report(&node) {
                Some(report) => Response::ok(Payload::Nodes(vec![report])),
                None => Response::NotFound,
            }),

            Operation::PauseNode { node } => self.pause_nodes(vec![node]).await,
            Operation::PauseNodes { nodes } => self.pause_nodes(nodes).await,
            Operation::ResumeNode { node } => self.control(vec![node], |name| self.failover.resume(name)),
            Operation::ResumeNodes { nodes } => self.control(nodes, |name| self.failover.resume(name)),
            Operation::ArriveNode { node } => self.control(vec![node], |name| self.failover.mark_arrived(name)),
            Operation::DeadNode { node } => self.control(vec![node], |name| self.failover.mark_dead(name)),
            Operation::StartRecovery { node } => {
                self.control(vec![node], |name| self.failover.start_recovery(name))
            }
            Operation::EndRecovery { node } => self.control(vec![node], |name| self.failover.end_recovery(name)),
        }
    }

    async fn calculate(&self, key: Vec<u8>, transaction: Option<String>, delta: i64) -> Result<Response> {
        self.check_key(&key)?;
        check_transaction(transaction.as_deref())?;
        let version = self.clock.next();
        let result = self
            .writer
            .calculate(&self.scoped(&key), delta, transaction.as_deref(), version)
            .await?;
        Ok(match result {
            Some(value) => Response::ok(Payload::Integer(value)),
            None => Response::NotFound,
        })
    }

    async fn write_tags(
        &self,
        tags: &[Vec<u8>],
        key: &[u8],
        transaction: Option<&str>,
        version: VersionStamp,
    ) -> Result<Vec<WriteReport>> {
        let mut reports = Vec::with_capacity(tags.len());
        for tag in tags {
            reports.push(self.writer.write_tag(&self.scoped(tag), key, transaction, version).await?);
        }
        Ok(reports)
    }

    /// Scoped keys of a tag. Unless `include_missing`, only keys that still
    /// exist are kept, and an empty result counts as not found.
    async fn tag_keys(&self, tag: &[u8], include_missing: bool) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(keys) = self.reader.get_tag_keys(tag).await? else {
            return Ok(None);
        };
        if include_missing {
            return Ok(Some(keys));
        }

        let reads = join_all(keys.iter().map(|key| self.reader.get(key))).await;
        let mut existing = Vec::with_capacity(keys.len());
        for (key, read) in keys.into_iter().zip(reads) {
            if read?.found() {
                existing.push(key);
            }
        }

        Ok(if existing.is_empty() { None } else { Some(existing) })
    }

    /// Read scoped keys concurrently; entries carry unscoped keys
    async fn multi_get(&self, keys: Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let reads = join_all(keys.iter().map(|key| self.reader.get(key))).await;
        keys.into_iter()
            .zip(reads)
            .map(|(key, read)| Ok((self.unscoped(key), read?.into_value().map(|v| v.value))))
            .collect()
    }

    async fn pause_nodes(&self, nodes: Vec<String>) -> Result<Response> {
        if let Some(response) = self.check_nodes(&nodes)? {
            return Ok(response);
        }
        let results = join_all(nodes.iter().map(|name| self.failover.pause(name))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(Response::empty())
    }

    fn control<F>(&self, nodes: Vec<String>, action: F) -> Result<Response>
    where
        F: Fn(&str) -> Result<()>,
    {
        if let Some(response) = self.check_nodes(&nodes)? {
            return Ok(response);
        }
        for name in &nodes {
            action(name)?;
        }
        Ok(Response::empty())
    }

    /// `NotFound` response when any node is unknown
    fn check_nodes(&self, nodes: &[String]) -> Result<Option<Response>> {
        if nodes.is_empty() {
            return Err(Error::Validation("node list is empty".into()));
        }
        if let Some(unknown) = nodes.iter().find(|name| !self.failover.contains(name)) {
            tracing::debug!("Control request for unknown node {}", unknown);
            return Ok(Some(Response::NotFound));
        }
        Ok(None)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("key is empty".into()));
        }
        if key.len() >= self.limits.max_key_length {
            return Err(Error::Validation(format!(
                "key length {} exceeds limit {}",
                key.len(),
                self.limits.max_key_length.saturating_sub(1)
            )));
        }
        Ok(())
    }

    fn check_tags(&self, tags: &[Vec<u8>]) -> Result<()> {
        tags.iter().try_for_each(|tag| self.check_key(tag))
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.limits.max_value_length {
            return Err(Error::Validation(format!(
                "value length {} exceeds limit {}",
                value.len(),
                self.limits.max_value_length
            )));
        }
        Ok(())
    }

    fn scoped(&self, key: &[u8]) -> Vec<u8> {
        match &self.prefix {
            Some(prefix) => [prefix.as_slice(), key].concat(),
            None => key.to_vec(),
        }
    }

    fn unscoped(&self, key: Vec<u8>) -> Vec<u8> {
        match &self.prefix {
            Some(prefix) if key.starts_with(prefix) => key[prefix.len()..].to_vec(),
            _ => key,
        }
    }
}

fn check_transaction(transaction: Option<&str>) -> Result<()> {
    match transaction {
        Some(code) if code.is_empty() => Err(Error::Validation("transaction code is empty".into())),
        _ => Ok(()),
    }
}

fn check_script(script: &str) -> Result<()> {
    if script.is_empty() {
        return Err(Error::Validation("script is empty".into()));
    }
    Ok(())
}

fn stored(version: VersionStamp) -> Response {
    Response::Success {
        payload: Payload::Empty,
        version: Some(version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::master::request::Status;
    use crate::network::NodeRequest;
    use crate::replication::{ALREADY_REGISTERED, ALREADY_UPDATED};
    use crate::state::NodeHealth;
    use crate::testing::MemoryCluster;

    const CONFIG: &str = r#"
[node]
id = "master-1"
bind_address = "127.0.0.1:0"

[dispatch]
consistency = "strong"

[[rules]]
generation = 2
[[rules.groups]]
primary = "a:1"
secondary = "b:1"
tertiary = "c:1"

[[rules]]
generation = 1
[[rules.groups]]
primary = "d:1"

[limits]
max_key_length = 16
max_value_length = 32
"#;

    fn engine_with(extra: &str) -> (Arc<MemoryCluster>, MasterEngine) {
        let config = MasterConfig::from_str(&format!("{}{}", CONFIG, extra)).unwrap();
        let cluster = Arc::new(MemoryCluster::new(["a:1", "b:1", "c:1", "d:1", "tm:1"]));
        let engine = MasterEngine::new(&config, cluster.clone()).unwrap();
        (cluster, engine)
    }

    fn engine() -> (Arc<MemoryCluster>, MasterEngine) {
        engine_with("")
    }

    fn set(key: &str, value: &str, tags: &[&str]) -> Request {
        Request::new(Operation::Set {
            key: key.as_bytes().to_vec(),
            tags: tags.iter().map(|t| t.as_bytes().to_vec()).collect(),
            transaction: None,
            value: value.as_bytes().to_vec(),
        })
    }

    fn get(key: &str) -> Request {
        Request::new(Operation::Get {
            key: key.as_bytes().to_vec(),
        })
    }

    fn version_of(response: &Response) -> VersionStamp {
        match response {
            Response::Success { version: Some(v), .. } => *v,
            other => panic!("no version in {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (_, engine) = engine();
        assert!(engine.handle(set("k1", "v1", &[])).await.is_success());
        assert_eq!(engine.handle(get("k1")).await, Response::ok(Payload::Value(b"v1".to_vec())));
        assert_eq!(engine.handle(get("missing")).await, Response::NotFound);
    }

    #[tokio::test]
    async fn test_validation_never_reaches_nodes() {
        let (cluster, engine) = engine();
        let too_long = "k".repeat(16);
        let response = engine.handle(set(&too_long, "v", &[])).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Validation, .. }));
        assert_eq!(response.status(), Status::Error);

        let big = "v".repeat(33);
        let response = engine.handle(set("k", &big, &[])).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Validation, .. }));

        let response = engine.handle(set("k", "v", &[&"t".repeat(20)])).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Validation, .. }));

        assert!(cluster.requests("a:1").is_empty());
        // exactly at the limits is fine
        assert!(engine.handle(set(&"k".repeat(15), &"v".repeat(32), &[])).await.is_success());
    }

    #[tokio::test]
    async fn test_set_writes_tags_first() {
        let (cluster, engine) = engine();
        engine.handle(set("k1", "v", &["t1"])).await;

        let requests = cluster.requests("a:1");
        assert!(matches!(requests[0], NodeRequest::AppendTagKey { .. }));
        assert!(matches!(requests[1], NodeRequest::Set { .. }));
    }

    #[tokio::test]
    async fn test_tag_keys_filter_missing() {
        let (_, engine) = engine();
        engine.handle(set("k1", "v1", &["t"])).await;
        engine.handle(set("k2", "v2", &["t"])).await;
        engine
            .handle(Request::new(Operation::Remove {
                key: b"k2".to_vec(),
                transaction: None,
            }))
            .await;

        let all = engine
            .handle(Request::new(Operation::GetTagKeys {
                tag: b"t".to_vec(),
                include_missing: true,
            }))
            .await;
        assert_eq!(all, Response::ok(Payload::Keys(vec![b"k1".to_vec(), b"k2".to_vec()])));

        let existing = engine
            .handle(Request::new(Operation::GetTagKeys {
                tag: b"t".to_vec(),
                include_missing: false,
            }))
            .await;
        assert_eq!(existing, Response::ok(Payload::Keys(vec![b"k1".to_vec()])));

        let values = engine.handle(Request::new(Operation::GetTagValues { tag: b"t".to_vec() })).await;
        assert_eq!(
            values,
            Response::ok(Payload::Entries(vec![(b"k1".to_vec(), Some(b"v1".to_vec()))]))
        );
    }

    #[tokio::test]
    async fn test_tag_with_only_missing_keys_is_not_found() {
        let (cluster, engine) = engine();
        cluster.put_tag("a:1", b"t", b"gone");
        let response = engine
            .handle(Request::new(Operation::GetTagKeys {
                tag: b"t".to_vec(),
                include_missing: false,
            }))
            .await;
        assert_eq!(response, Response::NotFound);
    }

    #[tokio::test]
    async fn test_set_once_and_cas() {
        let (_, engine) = engine();
        let once = |value: &str| {
            Request::new(Operation::SetOnce {
                key: b"k".to_vec(),
                tags: vec![],
                transaction: None,
                value: value.as_bytes().to_vec(),
            })
        };
        assert!(engine.handle(once("v1")).await.is_success());
        assert_eq!(engine.handle(once("v2")).await, Response::refused(ALREADY_REGISTERED));

        let current = engine
            .handle(Request::new(Operation::GetWithVersion { key: b"k".to_vec() }))
            .await;
        let stamp = version_of(&current);

        let cas = |value: &str, expected: VersionStamp| {
            Request::new(Operation::SetIfVersion {
                key: b"k".to_vec(),
                tags: vec![b"t".to_vec()],
                transaction: None,
                value: value.as_bytes().to_vec(),
                expected,
            })
        };
        let updated = engine.handle(cas("v3", stamp)).await;
        assert!(updated.is_success());
        assert!(version_of(&updated) > stamp);

        let stale = engine.handle(cas("v4", stamp)).await;
        assert_eq!(stale, Response::refused(ALREADY_UPDATED));
        assert_eq!(stale.status(), Status::False);
        assert_eq!(engine.handle(get("k")).await, Response::ok(Payload::Value(b"v3".to_vec())));
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let (_, engine) = engine();
        engine.handle(set("n", "10", &[])).await;
        let incr = engine
            .handle(Request::new(Operation::Increment {
                key: b"n".to_vec(),
                transaction: None,
                delta: 5,
            }))
            .await;
        assert_eq!(incr, Response::ok(Payload::Integer(15)));

        let decr = engine
            .handle(Request::new(Operation::Decrement {
                key: b"n".to_vec(),
                transaction: None,
                delta: 3,
            }))
            .await;
        assert_eq!(decr, Response::ok(Payload::Integer(12)));
    }

    #[tokio::test]
    async fn test_multi_get_order() {
        let (_, engine) = engine();
        engine.handle(set("a", "1", &[])).await;
        engine.handle(set("c", "3", &[])).await;
        let response = engine
            .handle(Request::new(Operation::MultiGet {
                keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            }))
            .await;
        assert_eq!(
            response,
            Response::ok(Payload::Entries(vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"c".to_vec(), Some(b"3".to_vec())),
            ]))
        );
    }

    #[tokio::test]
    async fn test_isolation_prefix() {
        let cluster = Arc::new(MemoryCluster::new(["a:1", "b:1", "c:1", "d:1"]));
        let config = MasterConfig::from_str(&CONFIG.replace(
            "consistency = \"strong\"",
            "consistency = \"strong\"\nisolation_prefix = \"app1_\"",
        ))
        .unwrap();
        let engine = MasterEngine::new(&config, cluster.clone()).unwrap();

        engine.handle(set("k1", "v", &["t"])).await;
        assert!(cluster.stored("a:1", b"app1_k1").is_some());
        assert!(cluster.stored("a:1", b"k1").is_none());

        let keys = engine
            .handle(Request::new(Operation::GetTagKeys {
                tag: b"t".to_vec(),
                include_missing: true,
            }))
            .await;
        assert_eq!(keys, Response::ok(Payload::Keys(vec![b"k1".to_vec()])));
    }

    #[tokio::test]
    async fn test_transactions_disabled() {
        let (_, engine) = engine();
        let response = engine.handle(Request::new(Operation::StartTransaction)).await;
        assert_eq!(
            response,
            Response::Error {
                kind: ErrorKind::NotPermitted,
                message: "no transaction mode".into()
            }
        );
    }

    #[tokio::test]
    async fn test_transaction_lock_flow() {
        let (_, engine) = engine_with(
            "\n[transaction]\nenabled = true\nmanager = \"tm:1\"\nlock_gate_timeout_ms = 30\nlock_poll_interval_ms = 5\n",
        );
        let code = match engine.handle(Request::new(Operation::StartTransaction)).await {
            Response::Success {
                payload: Payload::Text(code),
                ..
            } => code,
            other => panic!("unexpected {:?}", other),
        };

        let lock = Request::new(Operation::Lock {
            key: b"k2".to_vec(),
            transaction: code.clone(),
            hold_secs: 0,
            wait_secs: 1,
        });
        assert!(engine.handle(lock).await.is_success());

        let owner = engine.handle(Request::new(Operation::LockOwner { key: b"k2".to_vec() })).await;
        assert_eq!(owner, Response::ok(Payload::Text(code.clone())));

        let foreign = Request::new(Operation::Set {
            key: b"k2".to_vec(),
            tags: vec![],
            transaction: Some("T2".into()),
            value: b"v".to_vec(),
        });
        let response = engine.handle(foreign).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Logical, .. }));

        let unlock = Request::new(Operation::Unlock {
            key: b"k2".to_vec(),
            transaction: code,
        });
        assert!(engine.handle(unlock).await.is_success());
    }

    #[tokio::test]
    async fn test_node_control() {
        let (_, engine) = engine();
        let dead = Request::new(Operation::DeadNode { node: "a:1".into() });
        assert!(engine.handle(dead.clone()).await.is_success());
        assert!(engine.handle(dead).await.is_success());
        assert_eq!(engine.failover().health("a:1"), Some(NodeHealth::Dead));

        let status = engine.handle(Request::new(Operation::NodeStatus { node: "a:1".into() })).await;
        match status {
            Response::Success {
                payload: Payload::Nodes(nodes),
                ..
            } => assert_eq!(nodes[0].health, NodeHealth::Dead),
            other => panic!("unexpected {:?}", other),
        }

        let pause = Request::new(Operation::PauseNodes {
            nodes: vec!["b:1".into(), "c:1".into()],
        });
        assert!(engine.handle(pause).await.is_success());
        assert_eq!(engine.failover().health("c:1"), Some(NodeHealth::Paused));

        let unknown = Request::new(Operation::PauseNodes {
            nodes: vec!["b:1".into(), "zz:9".into()],
        });
        assert_eq!(engine.handle(unknown).await, Response::NotFound);

        engine.handle(Request::new(Operation::ArriveNode { node: "a:1".into() })).await;
        assert_eq!(engine.failover().health("a:1"), Some(NodeHealth::Arrived));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_error_response() {
        let (cluster, engine) = engine();
        for name in ["a:1", "b:1", "c:1"] {
            cluster.set_down(name, true);
        }
        let response = engine.handle(set("k", "v", &[])).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Network, .. }));
        assert_eq!(response.status(), Status::Error);
    }

    #[tokio::test]
    async fn test_init_and_version() {
        let (_, engine) = engine();
        assert_eq!(
            engine.handle(Request::new(Operation::Init)).await,
            Response::ok(Payload::Integer(32))
        );
        let version = engine.handle(Request::new(Operation::Version)).await;
        assert_eq!(version, Response::ok(Payload::Text(format!("shardmaster {}", VERSION))));
    }

    #[tokio::test]
    async fn test_increment_keeps_version_checks_working() {
        let (cluster, engine) = engine();
        engine.handle(set("n", "1", &[])).await;
        let incr = engine
            .handle(Request::new(Operation::Increment {
                key: b"n".to_vec(),
                transaction: None,
                delta: 1,
            }))
            .await;
        assert_eq!(incr, Response::ok(Payload::Integer(2)));
        assert_eq!(
            cluster.stored("a:1", b"n").unwrap().version,
            cluster.stored("b:1", b"n").unwrap().version
        );

        let current = engine
            .handle(Request::new(Operation::GetWithVersion { key: b"n".to_vec() }))
            .await;
        let cas = engine
            .handle(Request::new(Operation::SetIfVersion {
                key: b"n".to_vec(),
                tags: vec![],
                transaction: None,
                value: b"10".to_vec(),
                expected: version_of(&current),
            }))
            .await;
        assert!(cas.is_success(), "current version refused: {:?}", cas);
        assert_eq!(engine.handle(get("n")).await, Response::ok(Payload::Value(b"10".to_vec())));
    }

    #[tokio::test]
    async fn test_script_operations() {
        let (cluster, engine) = engine();
        engine.handle(set("k1", "abc", &[])).await;

        let read = engine
            .handle(Request::new(Operation::GetScript {
                key: b"k1".to_vec(),
                script: "upper".into(),
            }))
            .await;
        assert_eq!(read, Response::ok(Payload::Value(b"ABC".to_vec())));

        let update = engine
            .handle(Request::new(Operation::GetScriptForUpdate {
                key: b"k1".to_vec(),
                script: "set:xyz".into(),
                transaction: None,
            }))
            .await;
        assert_eq!(update, Response::ok(Payload::Value(b"xyz".to_vec())));
        for name in ["a:1", "b:1", "c:1"] {
            assert_eq!(cluster.stored(name, b"k1").unwrap().value, b"xyz".to_vec());
        }

        let missing = engine
            .handle(Request::new(Operation::GetScript {
                key: b"missing".to_vec(),
                script: "upper".into(),
            }))
            .await;
        assert_eq!(missing, Response::NotFound);

        let empty = engine
            .handle(Request::new(Operation::GetScript {
                key: b"k1".to_vec(),
                script: String::new(),
            }))
            .await;
        assert!(matches!(empty, Response::Error { kind: ErrorKind::Validation, .. }));
    }

    #[tokio::test]
    async fn test_zero_key_limit_does_not_underflow() {
        let cluster = Arc::new(MemoryCluster::new(["a:1", "b:1", "c:1", "d:1"]));
        let mut config = MasterConfig::from_str(CONFIG).unwrap();
        config.limits.max_key_length = 0;
        let engine = MasterEngine::new(&config, cluster).unwrap();

        let response = engine.handle(get("k")).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Validation, .. }));
    }
}
