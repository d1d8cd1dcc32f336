//! Client Server
//!
//! Accepts client connections and feeds them to a fixed pool of workers
//! through one bounded session queue. After every response a worker either
//! keeps serving the same session or hands it back to the queue, depending on
//! how many workers are idle.

mod codec;

pub use codec::{BincodeCodec, ClientCodec};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::master::{MasterEngine, Operation, Response};

/// A client connection waiting for, or being served by, a worker
pub struct ClientSession {
    framed: Framed<TcpStream, ClientCodec>,
    peer: String,
    served: u64,
}

impl ClientSession {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            framed: Framed::new(stream, ClientCodec::new()),
            peer,
            served: 0,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// What a worker does with a session after serving it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep serving the same session
    Retain,
    /// Hand the session back to the shared queue
    Release,
    /// Drop the connection
    Close,
}

/// Retain or release after a response, given how many workers are waiting
pub fn after_response(waiting: usize, fairness_threshold: usize) -> Disposition {
    if waiting >= fairness_threshold {
        Disposition::Release
    } else {
        Disposition::Retain
    }
}

/// State shared by the accept loop and all workers
struct Shared {
    engine: Arc<MasterEngine>,
    queue_tx: mpsc::Sender<ClientSession>,
    queue_rx: Mutex<mpsc::Receiver<ClientSession>>,
    /// Workers currently blocked on the queue
    waiting: AtomicUsize,
    fairness_threshold: usize,
    idle_poll: Duration,
}

/// Worker pool serving client sessions
pub struct RequestDispatchLoop {
    shared: Arc<Shared>,
    workers: usize,
    shutdown: watch::Sender<bool>,
}

impl RequestDispatchLoop {
    pub fn new(engine: Arc<MasterEngine>, config: &WorkerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                engine,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                waiting: AtomicUsize::new(0),
                fairness_threshold: config.fairness_threshold,
                idle_poll: Duration::from_millis(config.idle_poll_ms),
            }),
            workers: config.count.max(1),
            shutdown,
        }
    }

    /// Number of workers currently waiting for a session
    pub fn waiting_workers(&self) -> usize {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    /// Start the worker pool
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|id| {
                let shared = Arc::clone(&self.shared);
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(async move { worker(id, shared, shutdown).await })
            })
            .collect()
    }

    /// Accept connections until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let workers = self.spawn_workers();
        tracing::info!(
            "Serving clients on {} with {} workers",
            listener.local_addr()?,
            workers.len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                            }
                            tracing::debug!("Client connected from {}", addr);
                            let session = ClientSession::new(socket, addr.to_string());
                            if self.shared.queue_tx.send(session).await.is_err() {
                                return Err(Error::ShuttingDown);
                            }
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        for handle in workers {
            let _ = handle.await;
        }
        tracing::info!("Client server stopped");
        Ok(())
    }

    /// Stop accepting and let workers exit
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn worker(id: usize, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    tracing::trace!("Worker {} started", id);

    loop {
        // FetchNext
        shared.waiting.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut queue = shared.queue_rx.lock().await;
            tokio::select! {
                session = queue.recv() => session,
                _ = shutdown.changed() => None,
            }
        };
        shared.waiting.fetch_sub(1, Ordering::SeqCst);

        let Some(mut session) = next else {
            break;
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            match serve_session(&shared, &mut session).await {
                Disposition::Retain => continue,
                Disposition::Close => {
                    tracing::debug!("Closing session {} after {} requests", session.peer, session.served);
                    break;
                }
                Disposition::Release => match shared.queue_tx.try_send(session) {
                    Ok(()) => break,
                    // queue full: nobody else could take it anyway
                    Err(mpsc::error::TrySendError::Full(returned)) => session = returned,
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
            }
        }
    }

    tracing::trace!("Worker {} stopped", id);
}

/// Decode, dispatch and respond to at most one request
async fn serve_session(shared: &Shared, session: &mut ClientSession) -> Disposition {
    let next = match timeout(shared.idle_poll, session.framed.next()).await {
        Ok(next) => next,
        Err(_) => return Disposition::Release,
    };

    let request = match next {
        None => return Disposition::Close,
        Some(Ok(request)) => request,
        Some(Err(Error::Io(e))) => {
            tracing::debug!("I/O error from {}: {}", session.peer, e);
            return Disposition::Close;
        }
        Some(Err(e)) => {
            tracing::warn!("Malformed request from {}: {}", session.peer, e);
            let _ = session.framed.send(Response::from(&e)).await;
            return Disposition::Close;
        }
    };

    if request.operation == Operation::Disconnect {
        return Disposition::Close;
    }

    let response = shared.engine.handle(request).await;
    if let Err(e) = session.framed.send(response).await {
        tracing::debug!("Failed to respond to {}: {}", session.peer, e);
        return Disposition::Close;
    }
    session.served += 1;

    after_response(shared.waiting.load(Ordering::SeqCst), shared.fairness_threshold)
}
