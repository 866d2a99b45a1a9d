use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ember_consensus::{ConsensusError, ProofOfWork};
use ember_core::{Block, ChainStore, CoreError, Mempool, Transaction, UtxoSet};

/// Ids remembered for flood suppression before old entries fall out.
const SEEN_CACHE_SIZE: usize = 1024;

/// A silent peer is cut after this long without a complete frame.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
}

/// Newline-delimited JSON wire frame. The tag is parsed first; frames with
/// an unknown tag fail deserialisation and are dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GossipMessage {
    NewTransaction(Transaction),
    NewBlock(Block),
}

/// An outbound peer. The connection mutex keeps concurrent broadcasts from
/// interleaving frames on the wire.
pub struct Peer {
    address: String,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl Peer {
    async fn connect(address: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self {
            address: address.to_string(),
            conn: tokio::sync::Mutex::new(Some(stream)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut conn = self.conn.lock().await;
        match conn.as_mut() {
            Some(stream) => stream.write_all(frame).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "peer connection closed",
            )),
        }
    }

    async fn close(&self) {
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Best-effort flood gossip over plain TCP. Received transactions and
/// blocks are validated against local state, applied, and re-broadcast
/// unless the bounded seen-cache says they already went round.
pub struct GossipNode {
    config: GossipConfig,
    chain: Arc<ChainStore>,
    utxos: Arc<UtxoSet>,
    mempool: Arc<Mempool>,
    pow: Arc<ProofOfWork>,
    peers: RwLock<Vec<Arc<Peer>>>,
    seen: Mutex<LruCache<String, ()>>,
    running: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    /// Fired when an applied-state invariant trips; the node process
    /// observes it and shuts down instead of running diverged.
    fatal: Arc<Notify>,
}

impl GossipNode {
    pub fn new(
        config: GossipConfig,
        chain: Arc<ChainStore>,
        utxos: Arc<UtxoSet>,
        mempool: Arc<Mempool>,
        pow: Arc<ProofOfWork>,
        fatal: Arc<Notify>,
    ) -> Self {
        let capacity = NonZeroUsize::new(SEEN_CACHE_SIZE).expect("seen cache size");
        Self {
            config,
            chain,
            utxos,
            mempool,
            pow,
            peers: RwLock::new(Vec::new()),
            seen: Mutex::new(LruCache::new(capacity)),
            running: AtomicBool::new(false),
            listener_task: Mutex::new(None),
            fatal,
        }
    }

    /// Dials the bootstrap peers (failures are logged, the peer is not
    /// kept) and spawns the accept loop. Returns the bound address.
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr, NetworkError> {
        self.running.store(true, Ordering::SeqCst);
        for address in &self.config.bootstrap_peers {
            match Peer::connect(address).await {
                Ok(peer) => self.peers.write().push(Arc::new(peer)),
                Err(e) => warn!(%address, "bootstrap dial failed: {e}"),
            }
        }
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "gossip listening");
        let node = Arc::clone(&self);
        let handle = tokio::spawn(async move { node.accept_loop(listener).await });
        *self.listener_task.lock() = Some(handle);
        Ok(local)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_task.lock().take() {
            handle.abort();
        }
        let peers: Vec<Arc<Peer>> = self.peers.read().iter().cloned().collect();
        for peer in peers {
            peer.close().await;
        }
        info!("gossip stopped");
    }

    /// Dials and registers a new outbound peer.
    pub async fn add_peer(&self, address: &str) -> Result<(), NetworkError> {
        let peer = Peer::connect(address).await?;
        self.peers.write().push(Arc::new(peer));
        info!(%address, "peer added");
        Ok(())
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers
            .read()
            .iter()
            .map(|p| p.address.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Local admission shared by the HTTP façade and the gossip handler:
    /// structural validation, not-already-committed, signature, balance
    /// feasibility, then the mempool.
    pub fn admit_transaction(&self, tx: &Transaction) -> ember_core::Result<()> {
        tx.validate()?;
        if self.chain.find_transaction(&tx.id).is_some() {
            return Err(CoreError::DuplicateTransaction(tx.id.clone()));
        }
        tx.verify_signature()?;
        self.utxos.validate_transaction(tx)?;
        self.mempool.add_transaction(tx.clone())
    }

    /// Marks the transaction as seen and floods it to every peer.
    pub async fn announce_transaction(&self, tx: Transaction) {
        self.mark_seen(&tx.id);
        self.broadcast(&GossipMessage::NewTransaction(tx)).await;
    }

    /// Marks the block as seen and floods it to every peer.
    pub async fn announce_block(&self, block: Block) {
        self.mark_seen(&block.hash);
        self.broadcast(&GossipMessage::NewBlock(block)).await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "inbound gossip connection");
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.read_connection(stream, remote).await });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    async fn read_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match tokio::time::timeout(READ_IDLE_TIMEOUT, lines.next_line()).await {
                Err(_) => {
                    debug!(%remote, "closing idle gossip connection");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!(%remote, "gossip read failed: {e}");
                    break;
                }
                Ok(Ok(Some(line))) => self.dispatch(&line).await,
            }
        }
    }

    async fn dispatch(&self, line: &str) {
        let message: GossipMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(_) => {
                debug!("ignoring unrecognised gossip frame");
                return;
            }
        };
        let result = match message {
            GossipMessage::NewTransaction(tx) => self.handle_transaction(tx).await,
            GossipMessage::NewBlock(block) => self.handle_block(block).await,
        };
        match result {
            Ok(()) => {}
            Err(NetworkError::Core(CoreError::ConsensusInvariantViolated(msg))) => {
                error!("consensus invariant violated in gossip handler: {msg}");
                self.fatal.notify_one();
            }
            Err(e) => debug!("gossip message rejected: {e}"),
        }
    }

    async fn handle_transaction(&self, tx: Transaction) -> Result<(), NetworkError> {
        if !self.mark_seen(&tx.id) {
            return Ok(());
        }
        // The seen-cache alone gates re-broadcast; admission reflects this
        // node's state, not what downstream peers still need.
        self.broadcast(&GossipMessage::NewTransaction(tx.clone()))
            .await;
        match self.admit_transaction(&tx) {
            Ok(()) => {
                debug!(id = %tx.id, "admitted gossiped transaction");
                Ok(())
            }
            // Already in the mempool or committed; nothing to do locally.
            Err(CoreError::DuplicateTransaction(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_block(&self, block: Block) -> Result<(), NetworkError> {
        if !self.mark_seen(&block.hash) {
            return Ok(());
        }
        self.pow.validate_block(&block)?;
        self.chain.add_block(block.clone(), &self.utxos)?;
        for tx in &block.transactions {
            self.mempool.remove_transaction(&tx.id);
        }
        debug!(height = block.index, hash = %block.hash, "accepted gossiped block");
        self.broadcast(&GossipMessage::NewBlock(block)).await;
        Ok(())
    }

    /// Serialises once and writes the frame to every known peer. Send
    /// failures are logged and the peer kept; delivery is best-effort.
    pub async fn broadcast(&self, message: &GossipMessage) {
        let mut frame = match serde_json::to_vec(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode gossip message: {e}");
                return;
            }
        };
        frame.push(b'\n');
        let peers: Vec<Arc<Peer>> = self.peers.read().iter().cloned().collect();
        for peer in peers {
            if let Err(e) = peer.send(&frame).await {
                warn!(peer = %peer.address, "broadcast failed: {e}");
            }
        }
    }

    // True when the id was not in the cache, i.e. this node sees it fresh.
    fn mark_seen(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(id) {
            return false;
        }
        seen.put(id.to_string(), ());
        true
    }
}
