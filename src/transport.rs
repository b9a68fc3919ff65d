//! Transport Module
//!
//! TCP connection management for the peer protocol: listening, dialing,
//! per-connection handshake and decode loops, and a single shared event
//! channel the owning file server drains.
//!
//! Per-connection lifecycle: Dialing/Accepting -> Handshaking ->
//! Established -> Closed. Every established connection runs its own decode
//! task, so the accept loop never blocks on one peer and frames from a
//! single peer are delivered in order. When a decode loop hits a stream
//! header it parks until the owner has consumed the raw bytes off the
//! socket, keeping the frame boundary in sync.

use crate::wire::{encode_control, write_stream_header, ControlMessage, Decoder, Frame, WireError};
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Protocol magic exchanged by the [`Handshake::Magic`] variant. The last
/// byte is the protocol version.
pub const PROTOCOL_MAGIC: [u8; 8] = *b"DRIFTFS\x01";

/// Errors that can occur in the transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("handshake failed with {addr}: {reason}")]
    HandshakeFailed { addr: SocketAddr, reason: String },

    #[error("peer {addr} unavailable")]
    PeerUnavailable { addr: SocketAddr },

    #[error("stream truncated: declared {declared} bytes, sent {sent}")]
    StreamTruncated { declared: u64, sent: u64 },

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Handshake strategy, run once per new connection before it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handshake {
    /// Trust-all: no exchange, always succeeds.
    #[default]
    Noop,
    /// Exchange the 8-byte protocol magic in both directions; any mismatch
    /// closes the connection before it is registered.
    Magic,
}

impl Handshake {
    async fn run(&self, stream: &mut TcpStream, addr: SocketAddr) -> TransportResult<()> {
        match self {
            Handshake::Noop => Ok(()),
            Handshake::Magic => {
                use tokio::io::AsyncWriteExt;
                stream.write_all(&PROTOCOL_MAGIC).await?;
                let mut theirs = [0u8; 8];
                stream
                    .read_exact(&mut theirs)
                    .await
                    .map_err(|e| TransportError::HandshakeFailed {
                        addr,
                        reason: format!("short magic exchange: {}", e),
                    })?;
                if theirs != PROTOCOL_MAGIC {
                    return Err(TransportError::HandshakeFailed {
                        addr,
                        reason: "protocol magic mismatch".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Configuration for the TCP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to listen on. Port 0 binds an ephemeral port; see
    /// [`TcpTransport::local_addr`].
    pub listen_addr: SocketAddr,
    /// Handshake to run on every new connection.
    pub handshake: Handshake,
    /// Frame decoding strategy for established connections.
    pub decoder: Decoder,
}

impl TransportConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            handshake: Handshake::default(),
            decoder: Decoder::default(),
        }
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = decoder;
        self
    }
}

/// Events emitted by the transport onto its shared channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake succeeded and the owner accepted the peer.
    PeerConnected { peer: std::sync::Arc<Peer> },
    /// The connection closed or errored; the peer is gone.
    PeerDisconnected { addr: SocketAddr },
    /// A control message arrived from `from`.
    Message {
        from: SocketAddr,
        message: ControlMessage,
    },
    /// A raw byte stream is waiting on `from`'s connection. The decode loop
    /// is parked until [`Peer::resume_reads`] is called.
    StreamIncoming { from: SocketAddr },
    /// Uninterpreted bytes from `from` ([`Decoder::Raw`] mode only).
    Raw { from: SocketAddr, bytes: Vec<u8> },
}

use std::sync::Arc;

/// Callback invoked synchronously after a successful handshake. Returning
/// an error closes the connection without registering it.
pub type OnPeer = Arc<dyn Fn(&Arc<Peer>) -> anyhow::Result<()> + Send + Sync>;

/// One established connection to a remote node.
pub struct Peer {
    remote_addr: SocketAddr,
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    resume: Notify,
}

impl Peer {
    /// Remote socket address; also the peer's identity in the owner's table.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True if this side dialed the connection.
    pub fn outbound(&self) -> bool {
        self.outbound
    }

    /// Send one control message frame.
    pub async fn send(&self, msg: &ControlMessage) -> TransportResult<()> {
        use tokio::io::AsyncWriteExt;
        let frame = encode_control(msg)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|_| TransportError::PeerUnavailable {
                addr: self.remote_addr,
            })?;
        writer
            .flush()
            .await
            .map_err(|_| TransportError::PeerUnavailable {
                addr: self.remote_addr,
            })?;
        Ok(())
    }

    /// Send a stream header followed by exactly `size` raw bytes from
    /// `reader`. The writer lock is held across the whole stream so no other
    /// frame can interleave with the payload.
    pub async fn send_stream<R>(&self, reader: &mut R, size: u64) -> TransportResult<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut writer = self.writer.lock().await;
        write_stream_header(&mut *writer).await?;
        let mut limited = reader.take(size);
        let sent = tokio::io::copy(&mut limited, &mut *writer)
            .await
            .map_err(|_| TransportError::PeerUnavailable {
                addr: self.remote_addr,
            })?;
        if sent != size {
            return Err(TransportError::StreamTruncated {
                declared: size,
                sent,
            });
        }
        use tokio::io::AsyncWriteExt;
        writer
            .flush()
            .await
            .map_err(|_| TransportError::PeerUnavailable {
                addr: self.remote_addr,
            })?;
        Ok(sent)
    }

    /// Borrow the connection's read half to consume raw stream bytes
    /// directly off the socket. Only valid while the decode loop is parked
    /// on a [`TransportEvent::StreamIncoming`] for this peer; call
    /// [`Peer::resume_reads`] when done.
    pub async fn raw_reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Unpark the decode loop after the raw stream has been fully consumed.
    pub fn resume_reads(&self) {
        self.resume.notify_one();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// The TCP transport: owns the listener and every per-connection task.
pub struct TcpTransport {
    config: TransportConfig,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    on_peer: StdMutex<Option<OnPeer>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl TcpTransport {
    /// Create a transport and the receiving end of its event channel.
    pub fn new(config: TransportConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let transport = Arc::new(Self {
            config,
            event_tx,
            on_peer: StdMutex::new(None),
            shutdown_tx,
            accept_task: StdMutex::new(None),
            local_addr: StdMutex::new(None),
        });
        (transport, event_rx)
    }

    /// Register the owner's peer-accepted callback. Must be set before
    /// `listen` for the owner to see any peers.
    pub fn set_on_peer(&self, on_peer: OnPeer) {
        *self.on_peer.lock().unwrap() = Some(on_peer);
    }

    /// The actual bound listen address, once `listen` has been called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Bind the listen address and spawn the accept loop.
    pub async fn listen(self: &Arc<Self>) -> TransportResult<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(bound);
        info!("transport listening on {}", bound);

        let transport = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("accept loop shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("accepted connection from {}", addr);
                                let t = Arc::clone(&transport);
                                tokio::spawn(async move {
                                    t.handle_connection(stream, false).await;
                                });
                            }
                            Err(e) => {
                                warn!("accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Open an outbound connection. The connection then runs the exact same
    /// per-connection path as an accepted one.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> TransportResult<()> {
        let stream = TcpStream::connect(addr).await?;
        debug!("dialed {}", addr);
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.handle_connection(stream, true).await;
        });
        Ok(())
    }

    /// Signal shutdown: the accept loop and every decode loop exit, and
    /// their sockets drop, unblocking any parked read. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Handshake, registration, then the decode loop. Runs for the life of
    /// one connection.
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, outbound: bool) {
        let addr = match stream.peer_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!("connection without peer address: {}", e);
                return;
            }
        };

        if let Err(e) = self.config.handshake.run(&mut stream, addr).await {
            warn!("dropping {}: {}", addr, e);
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Peer {
            remote_addr: addr,
            outbound,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            resume: Notify::new(),
        });

        let on_peer = self.on_peer.lock().unwrap().clone();
        if let Some(callback) = on_peer {
            if let Err(e) = callback(&peer) {
                warn!("owner rejected peer {}: {}", addr, e);
                return;
            }
        }

        info!(
            "peer {} established ({})",
            addr,
            if outbound { "outbound" } else { "inbound" }
        );
        let _ = self.event_tx.send(TransportEvent::PeerConnected {
            peer: Arc::clone(&peer),
        });

        self.decode_loop(&peer).await;

        debug!("connection to {} closed", addr);
        let _ = self
            .event_tx
            .send(TransportEvent::PeerDisconnected { addr });
    }

    /// Decode frames until clean close, error, or shutdown. Errors here are
    /// local to this connection and never propagate to other loops.
    async fn decode_loop(&self, peer: &Arc<Peer>) {
        let addr = peer.remote_addr;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let decoded = tokio::select! {
                _ = shutdown_rx.changed() => break,
                decoded = async {
                    let mut reader = peer.reader.lock().await;
                    self.config.decoder.decode(&mut *reader).await
                } => decoded,
            };

            match decoded {
                Ok(Some(Frame::Control(message))) => {
                    let _ = self
                        .event_tx
                        .send(TransportEvent::Message { from: addr, message });
                }
                Ok(Some(Frame::StreamHeader)) => {
                    let _ = self
                        .event_tx
                        .send(TransportEvent::StreamIncoming { from: addr });
                    // The owner reads the raw bytes straight off the socket;
                    // decoding anything before it finishes would desync the
                    // frame boundary.
                    peer.resume.notified().await;
                }
                Ok(Some(Frame::Raw(bytes))) => {
                    let _ = self
                        .event_tx
                        .send(TransportEvent::Raw { from: addr, bytes });
                }
                Ok(None) => {
                    debug!("peer {} closed the connection", addr);
                    break;
                }
                Err(e) => {
                    warn!("decode error from {}: {}", addr, e);
                    break;
                }
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
