//! File Server Module
//!
//! The orchestrator for one node: owns the local store, the encryption
//! codec, the TCP transport, and the peer table, and implements the
//! Store/Get/Delete replication protocol on top of them.
//!
//! - `store` encrypts into the local store, then replicates the ciphertext
//!   to every connected peer (best effort).
//! - `get` serves local hits without touching the network; on a miss it
//!   asks every peer and the first supplied copy wins, gets persisted
//!   locally (pull-through), and is decrypted for the caller.
//! - `delete` removes locally and tells peers to do the same (best effort,
//!   eventual).
//!
//! Every control message carries the origin node id; a node ignores its own
//! loop-back echoes and never re-forwards a message it received, so
//! broadcasts cannot loop.

use crate::crypto::{CryptoError, EncryptionKey, FileCipher};
use crate::store::{LocalStore, StoreError};
use crate::transport::{
    Handshake, Peer, TcpTransport, TransportConfig, TransportError, TransportEvent,
};
use crate::wire::ControlMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors that can occur during file server operations
#[derive(Error, Debug)]
pub enum FileServerError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("payload size mismatch for key {key}: declared {declared}, received {received}")]
    PayloadSizeMismatch {
        key: String,
        declared: u64,
        received: u64,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Configuration(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for file server operations
pub type FileServerResult<T> = Result<T, FileServerError>;

/// Configuration for one file server node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileServerConfig {
    /// Node identity; stamped as the origin on every outbound message.
    #[serde(default = "Uuid::new_v4")]
    pub node_id: Uuid,
    /// TCP listen address. Port 0 binds an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Root directory of this node's local store.
    pub storage_root: PathBuf,
    /// Peer addresses dialed once at startup. Individual failures are
    /// logged, never fatal.
    #[serde(default)]
    pub bootstrap_nodes: Vec<SocketAddr>,
    /// Cluster encryption key (hex in config files). Every node of a
    /// cluster must carry the same key to read each other's content.
    pub encryption_key: EncryptionKey,
    /// Handshake run on every new connection.
    #[serde(default)]
    pub handshake: Handshake,
    /// How long a network `get` waits for the first peer to supply a key.
    #[serde(default = "default_get_timeout_ms")]
    pub get_timeout_ms: u64,
}

fn default_get_timeout_ms() -> u64 {
    3000
}

impl FileServerConfig {
    /// A configuration with a fresh identity and a fresh random key.
    pub fn new<P: Into<PathBuf>>(listen_addr: SocketAddr, storage_root: P) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            listen_addr,
            storage_root: storage_root.into(),
            bootstrap_nodes: Vec::new(),
            encryption_key: EncryptionKey::generate(),
            handshake: Handshake::default(),
            get_timeout_ms: default_get_timeout_ms(),
        }
    }

    pub fn with_bootstrap_nodes(mut self, nodes: Vec<SocketAddr>) -> Self {
        self.bootstrap_nodes = nodes;
        self
    }

    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = key;
        self
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> FileServerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> FileServerResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> FileServerResult<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(FileServerError::InvalidConfiguration {
                reason: "storage_root must not be empty".to_string(),
            });
        }
        if self.get_timeout_ms == 0 {
            return Err(FileServerError::InvalidConfiguration {
                reason: "get_timeout_ms must be greater than 0".to_string(),
            });
        }
        if self.bootstrap_nodes.contains(&self.listen_addr) {
            return Err(FileServerError::InvalidConfiguration {
                reason: "a node must not bootstrap from itself".to_string(),
            });
        }
        Ok(())
    }
}

/// What the next raw stream from a peer carries.
#[derive(Debug)]
enum InboundStream {
    /// Persist under `key`, exactly `size` bytes.
    Store { key: String, size: u64 },
    /// Our own loop-back echo: consume and discard `size` bytes to keep the
    /// frame boundary intact.
    Discard { size: u64 },
}

/// One node of the distributed file store.
pub struct FileServer {
    id: Uuid,
    config: FileServerConfig,
    store: LocalStore,
    cipher: FileCipher,
    transport: Arc<TcpTransport>,
    /// Live connections by remote address. Mutated by the accept path (via
    /// the OnPeer callback), the disconnect path, and iterated by every
    /// broadcast; all access under this lock, iteration via snapshot.
    peers: Arc<StdMutex<HashMap<SocketAddr, Arc<Peer>>>>,
    /// Get-waiters per key, signalled when a peer-supplied copy lands.
    /// Keyed by waiter id so one caller's timeout removes only its own
    /// sender, never a concurrent caller's.
    pending_fetches: StdMutex<HashMap<String, HashMap<u64, oneshot::Sender<()>>>>,
    next_waiter_id: AtomicU64,
    /// Declared-but-unread streams per peer connection.
    inbound_streams: StdMutex<HashMap<SocketAddr, InboundStream>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    consumer_task: StdMutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    /// Create a file server. Call [`FileServer::start`] to begin listening
    /// and consuming peer traffic.
    pub fn new(config: FileServerConfig) -> FileServerResult<Arc<Self>> {
        config.validate()?;

        let transport_config = TransportConfig::new(config.listen_addr)
            .with_handshake(config.handshake);
        let (transport, event_rx) = TcpTransport::new(transport_config);

        let peers: Arc<StdMutex<HashMap<SocketAddr, Arc<Peer>>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        // Register every handshaken connection in the peer table. Runs on
        // both the accept and the dial path.
        let table = Arc::clone(&peers);
        transport.set_on_peer(Arc::new(move |peer: &Arc<Peer>| {
            let mut table = table.lock().unwrap();
            table.insert(peer.remote_addr(), Arc::clone(peer));
            debug!(
                "peer {} added to table ({} total)",
                peer.remote_addr(),
                table.len()
            );
            Ok(())
        }));

        info!(
            "file server {} storing under {:?}",
            config.node_id, config.storage_root
        );

        Ok(Arc::new(Self {
            id: config.node_id,
            store: LocalStore::new(config.storage_root.clone()),
            cipher: FileCipher::new(&config.encryption_key),
            transport,
            peers,
            pending_fetches: StdMutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
            inbound_streams: StdMutex::new(HashMap::new()),
            event_rx: Mutex::new(Some(event_rx)),
            consumer_task: StdMutex::new(None),
            config,
        }))
    }

    /// This node's identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The actual listen address once started (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Begin listening, dial the bootstrap nodes, and spawn the inbound
    /// message consumption loop.
    pub async fn start(self: &Arc<Self>) -> FileServerResult<()> {
        let event_rx = self
            .event_rx
            .lock()
            .await
            .take()
            .ok_or(FileServerError::AlreadyStarted)?;

        self.transport.listen().await?;

        for addr in &self.config.bootstrap_nodes {
            if let Err(e) = self.transport.dial(*addr).await {
                warn!("bootstrap dial {} failed: {}", addr, e);
            }
        }

        let server = Arc::clone(self);
        let task = tokio::spawn(server.consume_events(event_rx));
        *self.consumer_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Close the transport and release resources. Idempotent.
    pub fn stop(&self) {
        self.transport.close();
        if let Some(task) = self.consumer_task.lock().unwrap().take() {
            task.abort();
        }
        self.peers.lock().unwrap().clear();
        self.pending_fetches.lock().unwrap().clear();
        self.inbound_streams.lock().unwrap().clear();
    }

    /// Encrypt `reader` into the local store, then replicate the ciphertext
    /// to every connected peer. Returns the stored ciphertext size. Per-peer
    /// replication failures are logged, not propagated: the store succeeds
    /// once the local write does.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> FileServerResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.store.create(key).await?;
        let (plain, cipher_len) = self.cipher.encrypt_stream(reader, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        info!(
            "stored key {} ({} plaintext bytes, {} on disk)",
            key, plain, cipher_len
        );

        let announce = ControlMessage::StoreFile {
            origin: self.id,
            key: key.to_string(),
            size: cipher_len,
        };
        for peer in self.snapshot_peers() {
            if let Err(e) = self.replicate_to(&peer, &announce, key, cipher_len).await {
                warn!("replication of {} to {} failed: {}", key, peer.remote_addr(), e);
            }
        }
        Ok(cipher_len)
    }

    async fn replicate_to(
        &self,
        peer: &Arc<Peer>,
        announce: &ControlMessage,
        key: &str,
        size: u64,
    ) -> FileServerResult<()> {
        peer.send(announce).await?;
        let (_, mut file) = self.store.open_read(key).await?;
        peer.send_stream(&mut file, size).await?;
        debug!("replicated {} ({} bytes) to {}", key, size, peer.remote_addr());
        Ok(())
    }

    /// Fetch the content of `key` as plaintext bytes.
    pub async fn get(&self, key: &str) -> FileServerResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.get_to_writer(key, &mut buf).await?;
        Ok(buf)
    }

    /// Stream the plaintext of `key` into `writer`. A local hit never
    /// touches the network; a miss asks every peer and waits for the first
    /// supplied copy, which is persisted locally before being decrypted.
    pub async fn get_to_writer<W>(&self, key: &str, writer: &mut W) -> FileServerResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.store.has(key).await {
            if let Err(e) = self.fetch_from_peers(key).await {
                // A push-replicated copy may have landed between the check
                // above and the waiter registration; serve it if so.
                if !self.store.has(key).await {
                    return Err(e);
                }
            }
        }

        let (_, mut file) = match self.store.open_read(key).await {
            Ok(v) => v,
            Err(StoreError::NotFound { key }) => return Err(FileServerError::NotFound { key }),
            Err(e) => return Err(e.into()),
        };
        let n = self.cipher.decrypt_stream(&mut file, writer).await?;
        debug!("served key {} ({} plaintext bytes)", key, n);
        Ok(n)
    }

    /// Broadcast a GetFile and wait for the first peer to supply the key.
    async fn fetch_from_peers(&self, key: &str) -> FileServerResult<()> {
        let peers = self.snapshot_peers();
        if peers.is_empty() {
            return Err(FileServerError::NotFound {
                key: key.to_string(),
            });
        }

        info!("key {} not local, asking {} peers", key, peers.len());
        let (waiter_id, rx) = self.register_fetch_waiter(key);

        let request = ControlMessage::GetFile {
            origin: self.id,
            key: key.to_string(),
        };
        for peer in &peers {
            if let Err(e) = peer.send(&request).await {
                warn!("get request to {} failed: {}", peer.remote_addr(), e);
            }
        }

        let timeout = Duration::from_millis(self.config.get_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // This caller timed out (or was torn down). Concurrent callers
            // waiting on the same key keep their own senders and windows.
            _ => {
                self.drop_fetch_waiter(key, waiter_id);
                Err(FileServerError::NotFound {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Remove `key` locally and tell every peer to do the same. Replicated
    /// deletion is best-effort and eventual; the local removal alone decides
    /// success. Idempotent.
    pub async fn delete(&self, key: &str) -> FileServerResult<()> {
        self.store.delete(key).await?;
        info!("deleted key {}", key);

        let msg = ControlMessage::DeleteFile {
            origin: self.id,
            key: key.to_string(),
        };
        for peer in self.snapshot_peers() {
            if let Err(e) = peer.send(&msg).await {
                warn!("delete of {} on {} failed: {}", key, peer.remote_addr(), e);
            }
        }
        Ok(())
    }

    /// Whether this node holds `key` locally.
    pub async fn has(&self, key: &str) -> bool {
        self.store.has(key).await
    }

    fn snapshot_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    fn register_fetch_waiter(&self, key: &str) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.pending_fetches
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    fn drop_fetch_waiter(&self, key: &str, id: u64) {
        let mut pending = self.pending_fetches.lock().unwrap();
        if let Some(waiters) = pending.get_mut(key) {
            waiters.remove(&id);
            if waiters.is_empty() {
                pending.remove(key);
            }
        }
    }

    fn signal_fetch_waiters(&self, key: &str) {
        if let Some(waiters) = self.pending_fetches.lock().unwrap().remove(key) {
            for (_, waiter) in waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// The inbound consumption loop: drains the transport's shared event
    /// channel for the life of the node.
    async fn consume_events(
        self: Arc<Self>,
        mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            match event {
                // Table insertion happens in the OnPeer callback so a
                // rejection can still close the connection.
                TransportEvent::PeerConnected { peer } => {
                    debug!("peer {} connected", peer.remote_addr());
                }
                TransportEvent::PeerDisconnected { addr } => {
                    self.peers.lock().unwrap().remove(&addr);
                    self.inbound_streams.lock().unwrap().remove(&addr);
                    info!("peer {} removed from table", addr);
                }
                TransportEvent::Message { from, message } => {
                    self.dispatch(from, message).await;
                }
                TransportEvent::StreamIncoming { from } => {
                    self.handle_incoming_stream(from).await;
                }
                // The file server always runs the framed decoder; raw bytes
                // cannot occur outside it.
                TransportEvent::Raw { from, bytes } => {
                    debug!("{} uninterpreted bytes from {}", bytes.len(), from);
                }
            }
        }
        debug!("event channel closed, consumer exiting");
    }

    async fn dispatch(&self, from: SocketAddr, message: ControlMessage) {
        match message {
            ControlMessage::StoreFile { origin, key, size } => {
                self.handle_store_file(from, origin, key, size);
            }
            ControlMessage::GetFile { origin, key } => {
                self.handle_get_file(from, origin, &key).await;
            }
            ControlMessage::DeleteFile { origin, key } => {
                self.handle_delete_file(origin, &key).await;
            }
        }
    }

    /// Record what the stream that follows on this connection carries. The
    /// bytes themselves arrive with the next StreamIncoming event.
    fn handle_store_file(&self, from: SocketAddr, origin: Uuid, key: String, size: u64) {
        let inbound = if origin == self.id {
            // Own echo: never re-applied, but the declared bytes still have
            // to leave the socket or the framing desyncs.
            debug!("ignoring loop-back StoreFile for {} from {}", key, from);
            InboundStream::Discard { size }
        } else {
            InboundStream::Store { key, size }
        };
        self.inbound_streams.lock().unwrap().insert(from, inbound);
    }

    /// Serve a peer's request for a key we may hold. Replies on the same
    /// connection with a StoreFile announcement plus the ciphertext stream.
    async fn handle_get_file(&self, from: SocketAddr, origin: Uuid, key: &str) {
        if origin == self.id {
            debug!("ignoring loop-back GetFile for {}", key);
            return;
        }
        let Some(peer) = self.peers.lock().unwrap().get(&from).cloned() else {
            warn!("GetFile from unknown connection {}", from);
            return;
        };

        let (size, mut file) = match self.store.open_read(key).await {
            Ok(v) => v,
            Err(StoreError::NotFound { .. }) => {
                debug!("peer {} asked for {}, not held here", from, key);
                return;
            }
            Err(e) => {
                warn!("reading {} for peer {} failed: {}", key, from, e);
                return;
            }
        };

        let announce = ControlMessage::StoreFile {
            origin: self.id,
            key: key.to_string(),
            size,
        };
        let result = async {
            peer.send(&announce).await?;
            peer.send_stream(&mut file, size).await
        }
        .await;
        match result {
            Ok(sent) => info!("served {} ({} bytes) to {}", key, sent, from),
            Err(e) => warn!("serving {} to {} failed: {}", key, from, e),
        }
    }

    async fn handle_delete_file(&self, origin: Uuid, key: &str) {
        if origin == self.id {
            debug!("ignoring loop-back DeleteFile for {}", key);
            return;
        }
        match self.store.delete(key).await {
            Ok(()) => info!("deleted {} on behalf of {}", key, origin),
            Err(e) => warn!("replicated delete of {} failed: {}", key, e),
        }
    }

    /// Consume the raw bytes a peer declared, directly off its socket, then
    /// unpark its decode loop.
    async fn handle_incoming_stream(&self, from: SocketAddr) {
        let expected = self.inbound_streams.lock().unwrap().remove(&from);
        let Some(peer) = self.peers.lock().unwrap().get(&from).cloned() else {
            warn!("stream from unknown connection {}", from);
            return;
        };

        match expected {
            Some(InboundStream::Store { key, size }) => {
                let result = {
                    let mut reader = peer.raw_reader().await;
                    self.store.write_exact(&key, &mut *reader, size).await
                };
                peer.resume_reads();
                match result {
                    Ok(n) => {
                        info!("received {} ({} bytes) from {}", key, n, from);
                        self.signal_fetch_waiters(&key);
                    }
                    Err(StoreError::SizeMismatch {
                        key,
                        declared,
                        received,
                    }) => {
                        warn!(
                            "{}",
                            FileServerError::PayloadSizeMismatch {
                                key,
                                declared,
                                received,
                            }
                        );
                    }
                    Err(e) => warn!("persisting stream from {} failed: {}", from, e),
                }
            }
            Some(InboundStream::Discard { size }) => {
                use tokio::io::AsyncReadExt;
                let drained = {
                    let mut reader = peer.raw_reader().await;
                    let mut limited = (&mut *reader).take(size);
                    tokio::io::copy(&mut limited, &mut tokio::io::sink()).await
                };
                peer.resume_reads();
                if let Err(e) = drained {
                    warn!("draining loop-back stream from {} failed: {}", from, e);
                }
            }
            None => {
                // Stream with no preceding announcement: protocol violation.
                // Resuming lets the decode loop trip over the raw bytes and
                // tear down just this connection.
                warn!("unannounced stream from {}", from);
                peer.resume_reads();
            }
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_config(root: &TempDir) -> FileServerConfig {
        FileServerConfig::new("127.0.0.1:0".parse().unwrap(), root.path())
    }

    #[test]
    fn test_config_validation() {
        let tmp = TempDir::new().unwrap();
        let config = local_config(&tmp);
        assert!(config.validate().is_ok());

        let mut bad = local_config(&tmp);
        bad.get_timeout_ms = 0;
        assert!(matches!(
            bad.validate(),
            Err(FileServerError::InvalidConfiguration { .. })
        ));

        let mut own_bootstrap = local_config(&tmp);
        own_bootstrap.listen_addr = "127.0.0.1:9400".parse().unwrap();
        own_bootstrap.bootstrap_nodes = vec!["127.0.0.1:9400".parse().unwrap()];
        assert!(own_bootstrap.validate().is_err());
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let tmp = TempDir::new().unwrap();
        let config = local_config(&tmp);

        let path = tmp.path().join("node.yaml");
        config.save_to_file(&path).unwrap();
        let loaded = FileServerConfig::from_file(&path).unwrap();

        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.listen_addr, config.listen_addr);
        assert_eq!(loaded.encryption_key, config.encryption_key);
        assert_eq!(loaded.get_timeout_ms, config.get_timeout_ms);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(local_config(&tmp)).unwrap();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(FileServerError::AlreadyStarted)
        ));
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(local_config(&tmp)).unwrap();
        server.start().await.unwrap();
        server.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_connection_state() {
        let tmp = TempDir::new().unwrap();
        let server = FileServer::new(local_config(&tmp)).unwrap();
        server.start().await.unwrap();

        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        server
            .inbound_streams
            .lock()
            .unwrap()
            .insert(addr, InboundStream::Discard { size: 1 });

        server.stop();
        assert!(server.peers.lock().unwrap().is_empty());
        assert!(server.inbound_streams.lock().unwrap().is_empty());
    }
}
