//! TCP accept loop and connection fan-out (spec.md §2's "Network layer").
//!
//! One [`ConnectionActor`] per peer drives the handshake and gossip
//! dance; this module's job is to spin those up, route each actor's
//! [`InventoryVector`] announce channel through a shared fan-out, and
//! drain every actor's stream of freshly accepted objects into the
//! [`Pipeline`].

use crate::config::Config;
use crate::ports::{Identity, InMemoryAddressBook, InMemoryMessageStore, InMemoryPowQueue};
use bitmessage_core::address::PrivateKey;
use bitmessage_core::object::{InventoryVector, ObjectMessage};
use bitmessage_core::pow::PowEngine;
use bitmessage_net::connection::{ConnectionActor, ConnectionError, FLOOD_FANOUT};
use bitmessage_net::inventory::{InMemoryInventory, Inventory};
use bitmessage_net::messages::{VersionMessage, PROTOCOL_VERSION};
use bitmessage_net::peer::NetworkAddress;
use bitmessage_net::registry::{InMemoryNodeRegistry, NodeRegistry};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bind failed: {0}")]
    BindFailed(SocketAddr),
}

const ANNOUNCE_CHANNEL_CAPACITY: usize = 256;
const ACCEPTED_CHANNEL_CAPACITY: usize = 256;
const INVENTORY_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
/// How long a `synchronize` connection may sit without inv/getdata/object
/// traffic before it's considered drained.
const SYNCHRONIZE_QUIESCENCE: Duration = Duration::from_secs(10);

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Node state: config, the repository ports, and the network plumbing that
/// ties accepted connections to the [`Pipeline`].
pub struct Server {
    config: Config,
    address_book: Arc<InMemoryAddressBook>,
    messages: Arc<InMemoryMessageStore>,
    inventory: Arc<dyn Inventory>,
    registry: Arc<dyn NodeRegistry>,
    pipeline: Arc<Pipeline>,
    /// Per-connection announce senders, fed by the single receiver the
    /// pipeline floods new objects into.
    fanout: Arc<RwLock<HashMap<u64, mpsc::Sender<InventoryVector>>>>,
    next_conn_id: AtomicU64,
    announce_rx: Mutex<Option<mpsc::Receiver<InventoryVector>>>,
    accepted_rx: Mutex<Option<mpsc::Receiver<ObjectMessage>>>,
    accepted_tx: mpsc::Sender<ObjectMessage>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        config.validate().map_err(|e| {
            error!(error = %e, "invalid configuration");
            ServerError::BindFailed(config.listen)
        })?;

        let identities = config
            .streams
            .iter()
            .map(|&stream| Identity {
                label: format!("stream-{stream}"),
                key: PrivateKey::generate(4, stream),
                nonce_trials_per_byte: config.nonce_trials_per_byte,
                extra_bytes: config.extra_bytes,
            })
            .collect();
        let address_book = Arc::new(InMemoryAddressBook::new(identities));
        let messages = Arc::new(InMemoryMessageStore::new());
        let inventory: Arc<dyn Inventory> = Arc::new(InMemoryInventory::new());
        let registry: Arc<dyn NodeRegistry> = Arc::new(InMemoryNodeRegistry::new());
        let pow_engine = Arc::new(PowEngine::new());
        let pow_queue = Arc::new(InMemoryPowQueue::new());

        let (announce_tx, announce_rx) = mpsc::channel(ANNOUNCE_CHANNEL_CAPACITY);
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPTED_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let pipeline = Arc::new(Pipeline::new(
            address_book.clone(),
            messages.clone(),
            inventory.clone(),
            pow_engine,
            pow_queue,
            announce_tx,
            Vec::new(),
        ));

        for identity in address_book.identities() {
            info!(address = %identity.address(), label = %identity.label, "identity ready");
        }

        Ok(Arc::new(Self {
            config,
            address_book,
            messages,
            inventory,
            registry,
            pipeline,
            fanout: Arc::new(RwLock::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
            announce_rx: Mutex::new(Some(announce_rx)),
            accepted_rx: Mutex::new(Some(accepted_rx)),
            accepted_tx,
            shutdown_tx,
        }))
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn address_book(&self) -> &Arc<InMemoryAddressBook> {
        &self.address_book
    }

    pub fn messages(&self) -> &Arc<InMemoryMessageStore> {
        &self.messages
    }

    fn our_version(&self) -> VersionMessage {
        let stream = *self.config.streams.first().unwrap_or(&1) as u32;
        let us = NetworkAddress::new(stream, 1, self.config.listen.ip(), self.config.listen.port());
        VersionMessage {
            protocol: PROTOCOL_VERSION,
            services: 1,
            timestamp: unix_now(),
            recipient: us,
            sender: us,
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            streams: self.config.streams.clone(),
        }
    }

    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        info!(listen = %self.config.listen, streams = ?self.config.streams, "starting bitmessaged");

        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|_| ServerError::BindFailed(self.config.listen))?;
        info!(addr = %self.config.listen, "listening");

        let fanout_task = self.clone().spawn_fanout_task();
        let dispatch_task = self.clone().spawn_dispatch_task();
        let prune_task = self.clone().spawn_prune_task();

        for addr in self.config.bootstrap.clone() {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.dial(addr).await {
                    warn!(%addr, error = %e, "bootstrap dial failed");
                }
            });
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    warn!(%addr, error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        fanout_task.abort();
        dispatch_task.abort();
        prune_task.abort();
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<(), ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        self.run_connection(stream, addr).await
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
        self.run_connection(stream, addr).await
    }

    /// One-shot sync with a single peer (spec.md §4.6/§6's `synchronize`):
    /// dial, complete the handshake, exchange `inv`/`getdata` until traffic
    /// quiesces, then disconnect -- whichever of `timeout` or quiescence
    /// comes first. The connection is never registered in `fanout`, so it
    /// never receives flooded announces from other peers.
    pub async fn synchronize(self: &Arc<Self>, addr: SocketAddr, timeout: Duration) -> Result<(), ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        let (_ann_tx, ann_rx) = mpsc::channel(ANNOUNCE_CHANNEL_CAPACITY);

        let actor = ConnectionActor::new(
            stream,
            self.our_version(),
            self.inventory.clone(),
            self.registry.clone(),
            self.accepted_tx.clone(),
            ann_rx,
            SYNCHRONIZE_QUIESCENCE,
        );

        match tokio::time::timeout(timeout, actor.run()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%addr, "synchronize timed out");
                Ok(())
            }
        }
    }

    async fn run_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (ann_tx, ann_rx) = mpsc::channel(ANNOUNCE_CHANNEL_CAPACITY);
        self.fanout.write().insert(conn_id, ann_tx);

        let actor = ConnectionActor::new(
            stream,
            self.our_version(),
            self.inventory.clone(),
            self.registry.clone(),
            self.accepted_tx.clone(),
            ann_rx,
            Duration::from_secs(self.config.connection_ttl_secs),
        );
        let result = actor.run().await;
        self.fanout.write().remove(&conn_id);
        match &result {
            Ok(()) => debug!(%addr, "connection closed"),
            Err(e) => debug!(%addr, error = %e, "connection ended with error"),
        }
        result
    }

    /// Drains the pipeline's single announce channel, forwarding each newly
    /// accepted object to at most [`FLOOD_FANOUT`] random active connections
    /// rather than broadcasting to every peer.
    fn spawn_fanout_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self
                .announce_rx
                .lock()
                .await
                .take()
                .expect("fanout task spawned once");
            while let Some(iv) = rx.recv().await {
                let mut senders: Vec<_> = self.fanout.read().values().cloned().collect();
                let mut rng = rand::thread_rng();
                senders.shuffle(&mut rng);
                for sender in senders.into_iter().take(FLOOD_FANOUT) {
                    let _ = sender.send(iv).await;
                }
            }
        })
    }

    /// Drains every connection's stream of freshly accepted objects into
    /// the pipeline's inbound dispatch.
    fn spawn_dispatch_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self
                .accepted_rx
                .lock()
                .await
                .take()
                .expect("dispatch task spawned once");
            while let Some(object) = rx.recv().await {
                if let Err(e) = self.pipeline.handle_inbound_object(&object).await {
                    warn!(error = %e, "failed to handle inbound object");
                }
            }
        })
    }

    fn spawn_prune_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(INVENTORY_PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.inventory.evict_expired(unix_now());
                        if evicted > 0 {
                            debug!(evicted, "pruned expired inventory entries");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connection_count: self.fanout.read().len(),
            known_peer_count: self.registry.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub connection_count: usize,
    pub known_peer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir: std::env::temp_dir(),
            streams: vec![1],
            bootstrap: vec![],
            connection_ttl_secs: 1800,
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            user_agent: "/bitmessage-rs:test/".into(),
            verbose: false,
            log_format: "pretty".into(),
        }
    }

    #[test]
    fn server_creates_one_identity_per_stream() {
        let server = Server::new(test_config()).unwrap();
        assert_eq!(server.address_book().identities().len(), 1);
    }

    #[test]
    fn fresh_server_has_no_connections() {
        let server = Server::new(test_config()).unwrap();
        assert_eq!(server.stats().connection_count, 0);
    }
}
