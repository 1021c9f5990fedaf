//! Wire framing for the control channel (spec §6 "Control channel": "Binary
//! request/response framing... each verb maps to one handler"). Every
//! [`Frame`] is a 4-byte big-endian length prefix followed by that many
//! bytes of JSON, matching the length-prefix-plus-body shape the rest of
//! this workspace already uses for its other binary formats.
//!
//! Long transfers (file/directory copy) don't fit in one frame, so a
//! request or response can be followed by a run of `*Chunk` frames and a
//! terminating `*ChunkEnd` frame, all carrying the same `id`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vminit_common::{AgentError, ErrorKind};

use crate::request::Request;
use crate::response::Response;

/// Caps a single frame body; guards against a corrupt or hostile length
/// prefix forcing an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

pub type RequestId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Request { id: RequestId, request: Request },
    RequestChunk { id: RequestId, data: Vec<u8> },
    RequestChunkEnd { id: RequestId },
    Response { id: RequestId, response: Response },
    ResponseChunk { id: RequestId, data: Vec<u8> },
    ResponseChunkEnd { id: RequestId },
    Cancel { id: RequestId },
}

impl Frame {
    /// The request/response identifier every variant carries, used to
    /// multiplex concurrent in-flight requests on one connection.
    pub fn id(&self) -> RequestId {
        match self {
            Frame::Request { id, .. }
            | Frame::RequestChunk { id, .. }
            | Frame::RequestChunkEnd { id }
            | Frame::Response { id, .. }
            | Frame::ResponseChunk { id, .. }
            | Frame::ResponseChunkEnd { id }
            | Frame::Cancel { id } => *id,
        }
    }
}

/// Write one length-prefixed JSON frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), AgentError> {
    let body = serde_json::to_vec(frame).map_err(|e| AgentError::new(ErrorKind::InvalidArgument, "write_frame", e.to_string()))?;
    let len: u32 = body
        .len()
        .try_into()
        .map_err(|_| AgentError::new(ErrorKind::InvalidArgument, "write_frame", "frame too large to encode"))?;
    writer
        .write_u32(len)
        .await
        .map_err(|e| AgentError::from_errno("write_frame", e))?;
    writer.write_all(&body).await.map_err(|e| AgentError::from_errno("write_frame", e))?;
    writer.flush().await.map_err(|e| AgentError::from_errno("write_frame", e))
}

/// Read one length-prefixed JSON frame, or `Ok(None)` on clean EOF before
/// any bytes of the length prefix arrive.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, AgentError> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(AgentError::from_errno("read_frame", e)),
    };
    if len > MAX_FRAME_BYTES {
        return Err(AgentError::new(
            ErrorKind::InvalidArgument,
            "read_frame",
            format!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(|e| AgentError::from_errno("read_frame", e))?;
    let frame = serde_json::from_slice(&body).map_err(|e| AgentError::new(ErrorKind::InvalidArgument, "read_frame", e.to_string()))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = Frame::Response { id: 7, response: Response::Ack };
        write_frame(&mut client, &frame).await.unwrap();
        let read_back = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(read_back.id(), 7);
        matches!(read_back, Frame::Response { response: Response::Ack, .. });
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result = read_frame(&mut server).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();
        let result = read_frame(&mut server).await;
        assert!(result.is_err());
    }
}
