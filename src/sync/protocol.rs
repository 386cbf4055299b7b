//! Wire protocol for tether.
//!
//! One ordered byte stream carries two disjoint record families:
//! `ClientMsg` (client -> server) and `ServerMsg` (server -> client).
//! Direction is implicit, so the two families share a single tag space.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Names are length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 MiB) - prevents OOM from corrupted frames.
/// A legitimate frame holds a file name, a few integers and at most one
/// chunk-sized data buffer.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Width of a chunk digest on the wire (MD5).
pub const HASH_LEN: usize = 16;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    FileUpdated = 0x01,
    FileRemoved = 0x02,
    FileNewData = 0x03,
    FileReuseData = 0x04,
    FileEnd = 0x05,
    ChunkHash = 0x06,
    HashEnd = 0x07,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::FileUpdated),
            0x02 => Some(Self::FileRemoved),
            0x03 => Some(Self::FileNewData),
            0x04 => Some(Self::FileReuseData),
            0x05 => Some(Self::FileEnd),
            0x06 => Some(Self::ChunkHash),
            0x07 => Some(Self::HashEnd),
            _ => None,
        }
    }
}

// =============================================================================
// File names
// =============================================================================

/// Check that a wire name is a plain, visible file name: relative, flat,
/// and outside the hidden `.`-prefix namespace reserved for temp sinks.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("empty file name");
    }
    if name.starts_with('.') {
        anyhow::bail!("hidden file name not allowed: {name:?}");
    }
    if name.contains(['/', '\\', '\0']) {
        anyhow::bail!("file name must be flat: {name:?}");
    }
    Ok(())
}

fn name_len(name: &str) -> usize {
    2 + name.len()
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
}

fn get_name(payload: &mut Bytes) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("file name length truncated");
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!("file name truncated");
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec()).context("invalid UTF-8 in file name")
}

fn encode_name_only(msg_type: MessageType, name: &str) -> Bytes {
    let payload_len = name_len(name);
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    put_name(&mut buf, name);
    buf.freeze()
}

// =============================================================================
// ClientMsg (client -> server)
// =============================================================================

/// File-level change announcements plus the reuse/replace reply stream the
/// client produces for one hash stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// A watched file appeared or changed. Carries no sequence number; the
    /// server mints one when it schedules the job.
    Updated { file: String },

    /// A watched file was deleted.
    Removed { file: String },

    /// Bytes the server's copy does not have. `data.len()` is the
    /// authoritative write length; `skip` tells the server how far to
    /// advance the read cursor of its old copy past the stale region.
    NewData {
        file: String,
        seq_no: u64,
        skip: u64,
        data: Bytes,
    },

    /// The server's chunk hash matched: reuse `length` bytes of its copy.
    ReuseData {
        file: String,
        seq_no: u64,
        length: u64,
    },

    /// End of the reply stream for this job. The server decides to publish
    /// or discard when this arrives.
    End { file: String, seq_no: u64 },
}

impl ClientMsg {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMsg::Updated { .. } => MessageType::FileUpdated,
            ClientMsg::Removed { .. } => MessageType::FileRemoved,
            ClientMsg::NewData { .. } => MessageType::FileNewData,
            ClientMsg::ReuseData { .. } => MessageType::FileReuseData,
            ClientMsg::End { .. } => MessageType::FileEnd,
        }
    }

    pub fn file(&self) -> &str {
        match self {
            ClientMsg::Updated { file }
            | ClientMsg::Removed { file }
            | ClientMsg::NewData { file, .. }
            | ClientMsg::ReuseData { file, .. }
            | ClientMsg::End { file, .. } => file,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            ClientMsg::Updated { file } => encode_name_only(MessageType::FileUpdated, file),
            ClientMsg::Removed { file } => encode_name_only(MessageType::FileRemoved, file),
            ClientMsg::NewData {
                file,
                seq_no,
                skip,
                data,
            } => {
                let payload_len = name_len(file) + 8 + 8 + 4 + data.len();
                let mut buf = BytesMut::with_capacity(5 + payload_len);
                buf.put_u32(payload_len as u32);
                buf.put_u8(MessageType::FileNewData as u8);
                put_name(&mut buf, file);
                buf.put_u64(*seq_no);
                buf.put_u64(*skip);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
                buf.freeze()
            }
            ClientMsg::ReuseData {
                file,
                seq_no,
                length,
            } => {
                let payload_len = name_len(file) + 8 + 8;
                let mut buf = BytesMut::with_capacity(5 + payload_len);
                buf.put_u32(payload_len as u32);
                buf.put_u8(MessageType::FileReuseData as u8);
                put_name(&mut buf, file);
                buf.put_u64(*seq_no);
                buf.put_u64(*length);
                buf.freeze()
            }
            ClientMsg::End { file, seq_no } => {
                let payload_len = name_len(file) + 8;
                let mut buf = BytesMut::with_capacity(5 + payload_len);
                buf.put_u32(payload_len as u32);
                buf.put_u8(MessageType::FileEnd as u8);
                put_name(&mut buf, file);
                buf.put_u64(*seq_no);
                buf.freeze()
            }
        }
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let msg = match msg_type {
            MessageType::FileUpdated => ClientMsg::Updated {
                file: get_name(&mut payload)?,
            },
            MessageType::FileRemoved => ClientMsg::Removed {
                file: get_name(&mut payload)?,
            },
            MessageType::FileNewData => {
                let file = get_name(&mut payload)?;
                if payload.remaining() < 20 {
                    anyhow::bail!("NewData payload truncated");
                }
                let seq_no = payload.get_u64();
                let skip = payload.get_u64();
                let data_len = payload.get_u32() as usize;
                if payload.remaining() < data_len {
                    anyhow::bail!("NewData content truncated");
                }
                let data = payload.copy_to_bytes(data_len);
                ClientMsg::NewData {
                    file,
                    seq_no,
                    skip,
                    data,
                }
            }
            MessageType::FileReuseData => {
                let file = get_name(&mut payload)?;
                if payload.remaining() < 16 {
                    anyhow::bail!("ReuseData payload truncated");
                }
                ClientMsg::ReuseData {
                    file,
                    seq_no: payload.get_u64(),
                    length: payload.get_u64(),
                }
            }
            MessageType::FileEnd => {
                let file = get_name(&mut payload)?;
                if payload.remaining() < 8 {
                    anyhow::bail!("End payload truncated");
                }
                ClientMsg::End {
                    file,
                    seq_no: payload.get_u64(),
                }
            }
            MessageType::ChunkHash | MessageType::HashEnd => {
                anyhow::bail!("{msg_type:?} is not valid on the client->server direction");
            }
        };
        Ok(msg)
    }
}

// =============================================================================
// ServerMsg (server -> client)
// =============================================================================

/// The hash stream: what the server's current copy looks like, chunk by
/// chunk, so the client can decide what not to resend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMsg {
    /// MD5 of one positional chunk of the server's current copy.
    ChunkHash {
        file: String,
        seq_no: u64,
        length: u64,
        hash: [u8; HASH_LEN],
    },

    /// Terminates the hash stream for one job. An empty hash stream
    /// (`HashEnd` alone) means "I have nothing; send everything".
    HashEnd { file: String, seq_no: u64 },
}

impl ServerMsg {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMsg::ChunkHash { .. } => MessageType::ChunkHash,
            ServerMsg::HashEnd { .. } => MessageType::HashEnd,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            ServerMsg::ChunkHash {
                file,
                seq_no,
                length,
                hash,
            } => {
                let payload_len = name_len(file) + 8 + 8 + HASH_LEN;
                let mut buf = BytesMut::with_capacity(5 + payload_len);
                buf.put_u32(payload_len as u32);
                buf.put_u8(MessageType::ChunkHash as u8);
                put_name(&mut buf, file);
                buf.put_u64(*seq_no);
                buf.put_u64(*length);
                buf.put_slice(hash);
                buf.freeze()
            }
            ServerMsg::HashEnd { file, seq_no } => {
                let payload_len = name_len(file) + 8;
                let mut buf = BytesMut::with_capacity(5 + payload_len);
                buf.put_u32(payload_len as u32);
                buf.put_u8(MessageType::HashEnd as u8);
                put_name(&mut buf, file);
                buf.put_u64(*seq_no);
                buf.freeze()
            }
        }
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let msg = match msg_type {
            MessageType::ChunkHash => {
                let file = get_name(&mut payload)?;
                if payload.remaining() < 16 + HASH_LEN {
                    anyhow::bail!("ChunkHash payload truncated");
                }
                let seq_no = payload.get_u64();
                let length = payload.get_u64();
                let mut hash = [0u8; HASH_LEN];
                payload.copy_to_slice(&mut hash);
                ServerMsg::ChunkHash {
                    file,
                    seq_no,
                    length,
                    hash,
                }
            }
            MessageType::HashEnd => {
                let file = get_name(&mut payload)?;
                if payload.remaining() < 8 {
                    anyhow::bail!("HashEnd payload truncated");
                }
                ServerMsg::HashEnd {
                    file,
                    seq_no: payload.get_u64(),
                }
            }
            _ => anyhow::bail!("{msg_type:?} is not valid on the server->client direction"),
        };
        Ok(msg)
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("failed to read frame length")?;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {len} exceeds maximum allowed size {MAX_FRAME_SIZE}");
    }

    let tag = r.read_u8().await.context("failed to read message type")?;
    let msg_type =
        MessageType::from_u8(tag).with_context(|| format!("unknown message type {tag:#04x}"))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("failed to write frame")?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
