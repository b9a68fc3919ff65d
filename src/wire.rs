//! Wire Protocol Module
//!
//! Framing for the peer protocol. Every frame starts with one tag byte:
//!
//! ```text
//! 0x01  control message: [tag:1][len:4 BE][bincode ControlMessage]
//! 0x02  stream header:   [tag:1]; the next N raw bytes on the connection
//!        belong to the stream, where N was declared by the preceding
//!        StoreFile control message
//! ```
//!
//! The stream header deliberately carries no payload: file content can be
//! arbitrarily large and must be consumed straight off the socket by the
//! file server, never buffered through the message decoder.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Frame tag: an inline control message follows.
pub const TAG_MESSAGE: u8 = 0x01;

/// Frame tag: raw stream bytes follow.
pub const TAG_STREAM: u8 = 0x02;

/// Upper bound on an encoded control message. Anything larger is a protocol
/// violation and is rejected before allocation.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed frame: {reason}")]
    Decode { reason: String },

    #[error("control message too large: {size} bytes (max {MAX_MESSAGE_SIZE})")]
    MessageTooLarge { size: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;

/// Control messages of the replication protocol. Every message names its
/// origin node so receivers can drop their own loop-back echoes and never
/// re-forward a message on behalf of its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Announce a replicated write: a ciphertext stream of `size` bytes for
    /// `key` follows on this connection.
    StoreFile { origin: Uuid, key: String, size: u64 },
    /// Ask every peer for the content of `key`; whoever has it replies with
    /// a StoreFile + stream on the same connection.
    GetFile { origin: Uuid, key: String },
    /// Remove the local copy of `key`.
    DeleteFile { origin: Uuid, key: String },
}

impl ControlMessage {
    /// The node that produced this message.
    pub fn origin(&self) -> Uuid {
        match self {
            Self::StoreFile { origin, .. }
            | Self::GetFile { origin, .. }
            | Self::DeleteFile { origin, .. } => *origin,
        }
    }

    /// The key this message is about.
    pub fn key(&self) -> &str {
        match self {
            Self::StoreFile { key, .. }
            | Self::GetFile { key, .. }
            | Self::DeleteFile { key, .. } => key,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An inline control message.
    Control(ControlMessage),
    /// Raw stream bytes follow on the connection; the decoder has consumed
    /// only the tag byte.
    StreamHeader,
    /// Uninterpreted bytes (raw decoder mode only).
    Raw(Vec<u8>),
}

/// Encode a control message frame.
pub fn encode_control(msg: &ControlMessage) -> WireResult<Vec<u8>> {
    let payload = bincode::serialize(msg).map_err(|e| WireError::Decode {
        reason: format!("serialize: {}", e),
    })?;
    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(TAG_MESSAGE);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write the stream-header tag announcing that raw bytes follow.
pub async fn write_stream_header<W: AsyncWrite + Unpin>(writer: &mut W) -> WireResult<()> {
    writer.write_u8(TAG_STREAM).await?;
    Ok(())
}

/// Frame decoding strategy, selected at transport construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decoder {
    /// Tagged frames as documented above.
    #[default]
    Framed,
    /// No interpretation: each read yields the bytes verbatim. For
    /// transports whose payloads carry no structure.
    Raw,
}

impl Decoder {
    /// Decode the next frame from `reader`. `Ok(None)` is a clean
    /// peer-initiated close (EOF on a frame boundary) and is non-fatal; EOF
    /// in the middle of a frame is a decode error.
    pub async fn decode<R>(&self, reader: &mut R) -> WireResult<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Decoder::Raw => {
                let mut buf = vec![0u8; 1024];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(Frame::Raw(buf)))
            }
            Decoder::Framed => {
                let tag = match reader.read_u8().await {
                    Ok(t) => t,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                };

                match tag {
                    TAG_STREAM => Ok(Some(Frame::StreamHeader)),
                    TAG_MESSAGE => {
                        let len = reader.read_u32().await.map_err(eof_is_decode)?;
                        if len > MAX_MESSAGE_SIZE {
                            return Err(WireError::MessageTooLarge { size: len });
                        }
                        let mut payload = vec![0u8; len as usize];
                        reader
                            .read_exact(&mut payload)
                            .await
                            .map_err(eof_is_decode)?;
                        let msg =
                            bincode::deserialize(&payload).map_err(|e| WireError::Decode {
                                reason: format!("control message: {}", e),
                            })?;
                        Ok(Some(Frame::Control(msg)))
                    }
                    other => Err(WireError::Decode {
                        reason: format!("unknown frame tag 0x{:02x}", other),
                    }),
                }
            }
        }
    }
}

/// EOF after the tag byte means a partner died mid-frame, which is a
/// protocol error, not a clean close.
fn eof_is_decode(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Decode {
            reason: "connection closed mid-frame".to_string(),
        }
    } else {
        WireError::Io(e)
    }
}
