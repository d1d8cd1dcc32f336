//! Node Client
//!
//! Pooled TCP client for data nodes. A connection serves exactly one request
//! at a time: it is checked out of the pool, used, and explicitly returned
//! once the response has been read or the fire-and-forget frame is flushed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_frame, write_frame, NodeEnvelope, NodeRequest, NodeResponse, NodeTransport, TimeoutClass};
use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::state::NodeDescriptor;

/// Idle connection waiting in the pool
struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for data nodes
pub struct NodeClient {
    /// Idle connections per node address
    pool: Mutex<HashMap<String, Vec<PooledConnection>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    long_timeout: Duration,
    ping_timeout: Duration,
    /// Idle connections kept per node
    max_idle: usize,
}

impl NodeClient {
    /// Create a new client
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        long_timeout: Duration,
        ping_timeout: Duration,
        max_idle: usize,
    ) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            connect_timeout,
            request_timeout,
            long_timeout,
            ping_timeout,
            max_idle,
        }
    }

    /// Create a client from the timeout and pool settings
    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(
            config.connect_timeout(),
            config.request_timeout(),
            config.long_request_timeout(),
            Duration::from_millis(config.timeouts.ping_ms),
            config.failover.max_idle_connections,
        )
    }

    fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Standard => self.request_timeout,
            TimeoutClass::Long => self.long_timeout,
            TimeoutClass::Ping => self.ping_timeout,
            TimeoutClass::Wait(wait) => self.request_timeout + wait,
        }
    }

    /// Take an idle connection, or open a new one. The flag tells whether the
    /// connection came from the pool.
    async fn checkout(&self, address: &str) -> Result<(TcpStream, bool)> {
        let pooled = {
            let mut pool = self.pool.lock().await;
            pool.get_mut(address).and_then(|idle| idle.pop())
        };

        match pooled {
            Some(conn) => Ok((conn.stream, true)),
            None => Ok((self.connect(address).await?, false)),
        }
    }

    /// Return a healthy connection to the pool
    async fn checkin(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.lock().await;
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < self.max_idle {
            idle.push(PooledConnection {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// One request/response exchange on a checked-out connection. The
    /// stream is handed back only when the exchange completed.
    async fn exchange(
        &self,
        mut stream: TcpStream,
        address: &str,
        envelope: &NodeEnvelope,
        class: TimeoutClass,
    ) -> Result<(TcpStream, Option<NodeResponse>)> {
        let round_trip = async {
            write_frame(&mut stream, envelope).await?;
            if envelope.reply {
                Ok::<_, Error>(Some(read_frame(&mut stream, address).await?))
            } else {
                Ok(None)
            }
        };
        let response = timeout(self.timeout_for(class), round_trip)
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))??;
        Ok((stream, response))
    }

    async fn send(&self, node: &NodeDescriptor, request: NodeRequest, reply: bool, class: TimeoutClass) -> Result<Option<NodeResponse>> {
        let address = node.address();
        let envelope = NodeEnvelope { reply, request };

        let (stream, pooled) = self.checkout(address).await?;
        let error = match self.exchange(stream, address, &envelope, class).await {
            Ok((stream, response)) => {
                self.checkin(address, stream).await;
                return Ok(response);
            }
            Err(e) => e,
        };

        if !(pooled && stale_retry(&envelope.request, &error)) {
            return Err(error);
        }

        // The node most likely restarted; every idle connection to it is dead
        tracing::debug!("Stale pooled connection to {}, reconnecting: {}", address, error);
        self.drop_idle(address).await;

        let stream = self.connect(address).await?;
        let (stream, response) = self.exchange(stream, address, &envelope, class).await?;
        self.checkin(address, stream).await;
        Ok(response)
    }

    async fn drop_idle(&self, address: &str) {
        let mut pool = self.pool.lock().await;
        pool.remove(address);
    }

    /// Drop connections idle for longer than `max_idle`
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.lock().await;
        let now = Instant::now();

        for (address, idle) in pool.iter_mut() {
            let before = idle.len();
            idle.retain(|conn| now.duration_since(conn.last_used) <= max_idle);
            if idle.len() != before {
                tracing::debug!("Removed {} stale connections to {}", before - idle.len(), address);
            }
        }
        pool.retain(|_, idle| !idle.is_empty());
    }

    /// Close all idle connections
    pub async fn close_all(&self) {
        self.pool.lock().await.clear();
    }

    /// Number of idle pooled connections
    pub async fn connection_count(&self) -> usize {
        self.pool.lock().await.values().map(Vec::len).sum()
    }
}

/// Whether a failure on a pooled connection may be retried on a fresh one.
/// Timed-out requests and calculations may already have been applied.
fn stale_retry(request: &NodeRequest, error: &Error) -> bool {
    error.is_network()
        && !matches!(error, Error::ConnectionTimeout(_))
        && !matches!(request, NodeRequest::Calc { .. })
}

#[async_trait]
impl NodeTransport for NodeClient {
    async fn call(&self, node: &NodeDescriptor, request: NodeRequest, class: TimeoutClass) -> Result<NodeResponse> {
        let name = request.type_name();
        match self.send(node, request, true, class).await? {
            Some(response) => {
                tracing::trace!("{} -> {} answered {}", name, node, response.type_name());
                Ok(response)
            }
            None => Err(Error::Internal(format!("no response recorded for {} to {}", name, node))),
        }
    }

    async fn cast(&self, node: &NodeDescriptor, request: NodeRequest) -> Result<()> {
        self.send(node, request, false, TimeoutClass::Standard).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionStamp;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn client() -> NodeClient {
        NodeClient::new(
            Duration::from_millis(200),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_millis(200),
            4,
        )
    }

    /// Minimal node answering Ping with Pong and recording casts
    async fn spawn_node() -> (String, tokio::sync::mpsc::Receiver<NodeRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Ok(envelope) = read_frame::<NodeEnvelope, _>(&mut socket, "master").await {
                        let _ = tx.send(envelope.request.clone()).await;
                        if envelope.reply {
                            let response = match envelope.request {
                                NodeRequest::Ping => NodeResponse::Pong,
                                _ => NodeResponse::Stored,
                            };
                            if write_frame(&mut socket, &response).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        (address, rx)
    }

    /// Node that answers one request per connection and then hangs up,
    /// counting accepted connections
    async fn spawn_one_shot_node() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Ok(envelope) = read_frame::<NodeEnvelope, _>(&mut socket, "master").await {
                        let response = match envelope.request {
                            NodeRequest::Calc { .. } => NodeResponse::Calculated(1),
                            _ => NodeResponse::Pong,
                        };
                        let _ = write_frame(&mut socket, &response).await;
                    }
                });
            }
        });

        (address, accepted)
    }

    #[tokio::test]
    async fn test_call_reuses_connection() {
        let (address, _rx) = spawn_node().await;
        let node = NodeDescriptor::parse(&address).unwrap();
        let client = client();

        let response = client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await.unwrap();
        assert_eq!(response, NodeResponse::Pong);
        assert_eq!(client.connection_count().await, 1);

        client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await.unwrap();
        assert_eq!(client.connection_count().await, 1, "connection should be reused");
    }

    #[tokio::test]
    async fn test_cast_does_not_wait() {
        let (address, mut rx) = spawn_node().await;
        let node = NodeDescriptor::parse(&address).unwrap();
        let client = client();

        let request = NodeRequest::Remove {
            key: b"k".to_vec(),
            transaction: None,
        };
        client.cast(&node, request.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), request);
        assert_eq!(client.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = client();
        let node = NodeDescriptor::parse("127.0.0.1:1").unwrap();
        let result = client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await;
        assert!(result.unwrap_err().is_network());
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let (address, _rx) = spawn_node().await;
        let node = NodeDescriptor::parse(&address).unwrap();
        let client = client();
        client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.cleanup_stale(Duration::from_millis(1)).await;
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_pooled_connection_is_replaced() {
        let (address, accepted) = spawn_one_shot_node().await;
        let node = NodeDescriptor::parse(&address).unwrap();
        let client = client();

        client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await.unwrap();
        assert_eq!(client.connection_count().await, 1);
        // the node has closed the pooled connection by now
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await.unwrap();
        assert_eq!(response, NodeResponse::Pong);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(client.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_calculation_not_retried_on_stale_connection() {
        let (address, accepted) = spawn_one_shot_node().await;
        let node = NodeDescriptor::parse(&address).unwrap();
        let client = client();

        client.call(&node, NodeRequest::Ping, TimeoutClass::Ping).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calc = NodeRequest::Calc {
            key: b"n".to_vec(),
            delta: 1,
            version: VersionStamp::from_raw(2),
            transaction: None,
        };
        let result = client.call(&node, calc, TimeoutClass::Long).await;
        assert!(result.unwrap_err().is_network());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
