//! driftfs: a peer-to-peer distributed file store.
//!
//! Each node persists file content under a content-derived path, encrypts
//! payloads at the storage boundary, and replicates writes to connected
//! peers over a custom framed TCP protocol so any peer can serve a key it
//! holds or fetch one it does not.

pub mod crypto;
pub mod file_server;
pub mod storage_layout;
pub mod store;
pub mod transport;
pub mod wire;

pub use crypto::{EncryptionKey, FileCipher};
pub use file_server::{FileServer, FileServerConfig, FileServerError};
pub use storage_layout::{path_for_key, PathKey};
pub use store::LocalStore;
pub use transport::{Handshake, TcpTransport, TransportConfig};
pub use wire::{ControlMessage, Decoder};
