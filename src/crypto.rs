//! Encryption Codec Module
//!
//! Symmetric encryption of file payloads at the storage boundary. Content is
//! processed in 64 KiB chunks with XChaCha20-Poly1305, so arbitrarily large
//! files stream through without full buffering and every chunk is
//! authenticated.
//!
//! Ciphertext format (no header, EOF-terminated):
//!
//! ```text
//! [nonce:24][len:4 BE][ciphertext:len] ... repeated per chunk
//! ```
//!
//! An empty plaintext produces zero chunks, and decrypting an empty input
//! yields empty plaintext.
//!
//! The key is shared by every node of one cluster and provisioned through
//! configuration; it is never carried on the wire. A node that loses its key
//! can no longer read previously stored content.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Plaintext chunk size. Balances memory use against per-chunk nonce and
/// tag overhead.
const CHUNK_SIZE: usize = 64 * 1024;

/// XChaCha20 nonce length in bytes.
const NONCE_LEN: usize = 24;

/// Length of a cluster encryption key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors that can occur in the encryption codec
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed: data corrupted or wrong cluster key")]
    Decrypt,

    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// A symmetric cluster key. Generated once by the operator, configured on
/// every node of a cluster, never transmitted to peers.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        Self(XChaCha20Poly1305::generate_key(&mut OsRng).into())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex encoding used in config files and by `driftfs keygen`.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse the hex encoding produced by [`EncryptionKey::to_hex`].
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let s = s.trim();
        if s.len() != KEY_LEN * 2 {
            return Err(CryptoError::InvalidKey {
                reason: format!("expected {} hex chars, got {}", KEY_LEN * 2, s.len()),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| {
                CryptoError::InvalidKey {
                    reason: "non-hex character".to_string(),
                }
            })?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        write!(f, "EncryptionKey(..)")
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Chunked streaming cipher for file payloads.
pub struct FileCipher {
    cipher: XChaCha20Poly1305,
}

impl FileCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt everything from `reader` into `writer`. Returns
    /// `(plaintext_bytes, ciphertext_bytes)`; the latter is the exact number
    /// of bytes written and is what gets declared as the stream size on the
    /// wire.
    pub async fn encrypt_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> CryptoResult<(u64, u64)>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut plain_total = 0u64;
        let mut cipher_total = 0u64;

        loop {
            let n = read_up_to(reader, &mut buffer).await?;
            if n == 0 {
                break;
            }

            let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ciphertext = self
                .cipher
                .encrypt(&nonce, &buffer[..n])
                .map_err(|_| CryptoError::Encrypt)?;

            writer.write_all(&nonce).await?;
            writer.write_u32(ciphertext.len() as u32).await?;
            writer.write_all(&ciphertext).await?;

            plain_total += n as u64;
            cipher_total += (NONCE_LEN + 4 + ciphertext.len()) as u64;
        }

        writer.flush().await?;
        Ok((plain_total, cipher_total))
    }

    /// Decrypt chunk frames from `reader` until EOF, writing plaintext to
    /// `writer`. Returns plaintext bytes produced.
    pub async fn decrypt_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> CryptoResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        let mut nonce_buf = [0u8; NONCE_LEN];

        loop {
            match reader.read_exact(&mut nonce_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let nonce = XNonce::from(nonce_buf);

            let chunk_len = reader.read_u32().await? as usize;
            let mut ciphertext = vec![0u8; chunk_len];
            reader.read_exact(&mut ciphertext).await?;

            let plaintext = self
                .cipher
                .decrypt(&nonce, ciphertext.as_slice())
                .map_err(|_| CryptoError::Decrypt)?;

            writer.write_all(&plaintext).await?;
            total += plaintext.len() as u64;
        }

        writer.flush().await?;
        Ok(total)
    }
}

/// Fill `buf` as far as the reader allows before giving up at EOF. A plain
/// `read` may return short chunks; keeping chunks full keeps the ciphertext
/// overhead at its minimum.
async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_cipher() -> FileCipher {
        FileCipher::new(&EncryptionKey::from_bytes([0x42; KEY_LEN]))
    }

    async fn round_trip(data: &[u8]) -> Vec<u8> {
        let cipher = make_cipher();

        let mut encrypted = Vec::new();
        let (plain, cipher_len) = cipher
            .encrypt_stream(&mut Cursor::new(data.to_vec()), &mut encrypted)
            .await
            .unwrap();
        assert_eq!(plain, data.len() as u64);
        assert_eq!(cipher_len, encrypted.len() as u64);

        let mut decrypted = Vec::new();
        let n = cipher
            .decrypt_stream(&mut Cursor::new(encrypted), &mut decrypted)
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        decrypted
    }

    #[tokio::test]
    async fn test_round_trip_small() {
        let data = b"my big data file here!";
        assert_eq!(round_trip(data).await, data);
    }

    #[tokio::test]
    async fn test_round_trip_empty() {
        assert_eq!(round_trip(b"").await, b"");
    }

    #[tokio::test]
    async fn test_round_trip_multi_chunk() {
        let data = vec![0xA5u8; CHUNK_SIZE * 2 + 777];
        assert_eq!(round_trip(&data).await, data);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let cipher = make_cipher();
        let mut encrypted = Vec::new();
        cipher
            .encrypt_stream(&mut Cursor::new(b"secret".to_vec()), &mut encrypted)
            .await
            .unwrap();

        let other = FileCipher::new(&EncryptionKey::from_bytes([0x24; KEY_LEN]));
        let mut out = Vec::new();
        let result = other
            .decrypt_stream(&mut Cursor::new(encrypted), &mut out)
            .await;
        assert!(matches!(result, Err(CryptoError::Decrypt)));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let cipher = make_cipher();
        let mut encrypted = Vec::new();
        cipher
            .encrypt_stream(&mut Cursor::new(b"integrity matters".to_vec()), &mut encrypted)
            .await
            .unwrap();

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;

        let mut out = Vec::new();
        let result = cipher
            .decrypt_stream(&mut Cursor::new(encrypted), &mut out)
            .await;
        assert!(matches!(result, Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_key_hex_round_trip() {
        let key = EncryptionKey::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), KEY_LEN * 2);
        let parsed = EncryptionKey::from_hex(&hex).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_hex_rejects_bad_input() {
        assert!(EncryptionKey::from_hex("deadbeef").is_err());
        assert!(EncryptionKey::from_hex(&"zz".repeat(KEY_LEN)).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = EncryptionKey::generate();
        assert_eq!(format!("{:?}", key), "EncryptionKey(..)");
    }
}
