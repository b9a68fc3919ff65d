//! Local Store Module
//!
//! Durable byte storage for one node, keyed by logical key. The store is
//! encryption-agnostic: it persists whatever bytes it is handed, and the
//! file server hands it ciphertext only, so plaintext never touches disk.
//!
//! Physical locations come from [`crate::storage_layout::path_for_key`];
//! the store itself never invents paths.

use crate::storage_layout::path_for_key;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Errors that can occur during local store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("stream size mismatch for key {key}: declared {declared} bytes, received {received}")]
    SizeMismatch {
        key: String,
        declared: u64,
        received: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for local store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// On-disk byte storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`. The root directory is created lazily
    /// on first write.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        path_for_key(key).full_path(&self.root)
    }

    /// Create (or truncate) the file for `key`, creating any missing
    /// directory segments. The caller streams content into the returned
    /// handle.
    pub async fn create(&self, key: &str) -> StoreResult<File> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        debug!("created {:?} for key {}", path, key);
        Ok(file)
    }

    /// Write the full content of `reader` under `key`. Returns bytes written.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.create(key).await?;
        let written = tokio::io::copy(reader, &mut file).await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Write exactly `size` bytes from `reader` under `key`. A short read
    /// (peer closed or truncated the stream) fails with
    /// [`StoreError::SizeMismatch`] and removes the partial file rather than
    /// leaving a silently truncated copy behind.
    pub async fn write_exact<R>(&self, key: &str, reader: &mut R, size: u64) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.create(key).await?;
        let mut limited = reader.take(size);
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        if written != size {
            drop(file);
            let _ = fs::remove_file(self.path_of(key)).await;
            return Err(StoreError::SizeMismatch {
                key: key.to_string(),
                declared: size,
                received: written,
            });
        }
        file.sync_all().await?;
        Ok(written)
    }

    /// Open the file for `key` for reading. Returns its size and handle.
    pub async fn open_read(&self, key: &str) -> StoreResult<(u64, File)> {
        let path = self.path_of(key);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Size in bytes of the stored content for `key`.
    pub async fn size(&self, key: &str) -> StoreResult<u64> {
        match fs::metadata(self.path_of(key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether content exists for `key`. I/O errors count as "not present".
    pub async fn has(&self, key: &str) -> bool {
        fs::metadata(self.path_of(key)).await.is_ok()
    }

    /// Remove the content for `key` and prune now-empty parent segment
    /// directories. Removing an absent key is Ok (idempotent).
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_of(key);
        match fs::remove_file(&path).await {
            Ok(()) => debug!("deleted {:?} for key {}", path, key),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Prune empty segment directories back up toward the root.
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root {
                break;
            }
            match fs::remove_dir(&d).await {
                Ok(()) => {}
                // Not empty, or already gone: stop pruning.
                Err(_) => break,
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Remove the entire storage root. Used for teardown and tests.
    pub async fn clear(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("failed to clear storage root {:?}: {}", self.root, e);
                Err(e.into())
            }
        }
    }
}
