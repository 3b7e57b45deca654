use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::Frame;
use crate::{WireError, MAX_CHUNK_SIZE, MAX_PAYLOAD_SIZE};

/// Prefix a MessagePack payload with its big-endian `u32` length.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read one length-prefixed payload from `reader`.
///
/// Returns `Ok(None)` on EOF at a frame boundary. EOF inside the length
/// prefix or the payload is a [`WireError::Truncated`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::Truncated {
                expected: len_buf.len(),
                got: filled,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(WireError::Truncated {
                expected: len,
                got: filled,
            });
        }
        filled += n;
    }
    Ok(Some(Bytes::from(payload)))
}

/// Serialize, length-prefix, write, and flush one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame.to_payload()?;
    let bytes = encode(&payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// One planned artifact chunk: a span of the source byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Chunk sequence number, starting at 1.
    pub seq: u64,
    /// Byte offset into the artifact.
    pub offset: usize,
    /// Span length, ≤ [`MAX_CHUNK_SIZE`].
    pub len: usize,
    /// Whether this span ends the artifact.
    pub is_last: bool,
}

/// Split `total` bytes into chunk spans of at most [`MAX_CHUNK_SIZE`].
///
/// An empty input yields a single zero-length last chunk so the receiver
/// still observes `is_last`.
pub fn chunk_plan(total: usize) -> Vec<ChunkSpan> {
    if total == 0 {
        return vec![ChunkSpan {
            seq: 1,
            offset: 0,
            len: 0,
            is_last: true,
        }];
    }

    let mut spans = Vec::with_capacity(total.div_ceil(MAX_CHUNK_SIZE));
    let mut offset = 0;
    let mut seq = 1;
    while offset < total {
        let len = (total - offset).min(MAX_CHUNK_SIZE);
        spans.push(ChunkSpan {
            seq,
            offset,
            len,
            is_last: offset + len == total,
        });
        offset += len;
        seq += 1;
    }
    spans
}
