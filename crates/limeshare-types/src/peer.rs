//! Frames carried on a direct peer link.
//!
//! ```text
//! [0]      Frame kind: 0x01 control (UTF-8 JSON), 0x02 chunk
//! control: [1..]   JSON object tagged by "type"
//! chunk:   [1..5]  Chunk index (u32 BE)
//!          [5..]   Ciphertext
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame kind byte for JSON control frames.
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame kind byte for chunk frames.
pub const FRAME_CHUNK: u8 = 0x02;

/// Width of the chunk index header in a chunk frame.
pub const CHUNK_INDEX_HEADER: usize = 4;

/// Swarm bookkeeping messages understood by the link manager itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerControl {
    /// Sender holds these chunks and will serve them.
    HaveChunks { chunks: Vec<u32> },
    /// Sender asks for one chunk.
    WantChunk { chunk: u32 },
}

/// A decoded peer-link frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerFrame {
    Control(PeerControl),
    /// Any other JSON object; forwarded to the orchestrator untouched.
    Envelope(serde_json::Value),
    Chunk { index: u32, data: Bytes },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("chunk frame shorter than its index header ({0} bytes)")]
    ShortChunk(usize),
    #[error("control frame is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control frame has no string \"type\" field")]
    Untyped,
}

impl PeerFrame {
    pub fn chunk(index: u32, data: Bytes) -> Self {
        Self::Chunk { index, data }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Control(ctrl) => encode_json(ctrl),
            Self::Envelope(value) => encode_json(value),
            Self::Chunk { index, data } => {
                let mut buf = BytesMut::with_capacity(1 + CHUNK_INDEX_HEADER + data.len());
                buf.put_u8(FRAME_CHUNK);
                buf.put_u32(*index);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }

    pub fn decode(raw: Bytes) -> Result<Self, FrameError> {
        let kind = *raw.first().ok_or(FrameError::Empty)?;
        match kind {
            FRAME_CHUNK => {
                if raw.len() < 1 + CHUNK_INDEX_HEADER {
                    return Err(FrameError::ShortChunk(raw.len()));
                }
                let mut idx = [0u8; CHUNK_INDEX_HEADER];
                idx.copy_from_slice(&raw[1..1 + CHUNK_INDEX_HEADER]);
                Ok(Self::Chunk {
                    index: u32::from_be_bytes(idx),
                    data: raw.slice(1 + CHUNK_INDEX_HEADER..),
                })
            }
            FRAME_CONTROL => {
                let value: serde_json::Value = serde_json::from_slice(&raw[1..])?;
                let ty = value.get("type").and_then(|t| t.as_str()).ok_or(FrameError::Untyped)?;
                match ty {
                    "have_chunks" | "want_chunk" => Ok(Self::Control(serde_json::from_value(value)?)),
                    _ => Ok(Self::Envelope(value)),
                }
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> Bytes {
    let mut buf = Vec::with_capacity(64);
    buf.push(FRAME_CONTROL);
    // Serializing plain data into a Vec cannot fail.
    let _ = serde_json::to_writer(&mut buf, value);
    Bytes::from(buf)
}
