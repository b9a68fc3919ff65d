//! Storage Layout Module
//!
//! Maps a logical key to a physical on-disk location. The derivation is a
//! pure function of the key: every node computes the same location for the
//! same key without ever exchanging paths, which is what makes replication
//! by key alone work.
//!
//! Scheme:
//! - hash = sha256(key) hex
//! - the first `SEGMENT_COUNT * SEGMENT_LEN` characters are split into
//!   fixed-width directory segments for balanced fanout
//! - the full digest hex is the leaf filename

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Width of each directory segment in hex characters.
pub const SEGMENT_LEN: usize = 5;

/// Number of directory segments between the root and the leaf file.
pub const SEGMENT_COUNT: usize = 6;

/// A derived storage location: joined directory segments plus leaf name.
///
/// Recomputed from the key on every access, never cached or persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Slash-joined directory segments relative to the storage root.
    pub dirs: String,
    /// Leaf filename (full digest hex).
    pub filename: String,
}

impl PathKey {
    /// Full path of the file under `root`.
    pub fn full_path(&self, root: &Path) -> PathBuf {
        root.join(&self.dirs).join(&self.filename)
    }

    /// Path of the outermost segment directory under `root`. Deleting this
    /// removes everything derived from the key.
    pub fn first_segment(&self, root: &Path) -> PathBuf {
        match self.dirs.split('/').next() {
            Some(seg) => root.join(seg),
            None => root.join(&self.dirs),
        }
    }
}

/// Derive the storage location for a key. Deterministic and pure; two keys
/// collide only if sha256 collides.
pub fn path_for_key(key: &str) -> PathKey {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let segments: Vec<&str> = (0..SEGMENT_COUNT)
        .map(|i| &hex[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN])
        .collect();

    PathKey {
        dirs: segments.join("/"),
        filename: hex,
    }
}
