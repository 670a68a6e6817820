//! Frame codec for the wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬────────────────┬─────────────────┬───────────────────┐
//! │ kind(1B) │ stream id (4B) │ payload len (4B)│ payload           │
//! │ u8       │ u32 BE         │ u32 BE          │                   │
//! └──────────┴────────────────┴─────────────────┴───────────────────┘
//! ```
//! Framing errors cannot be resynchronized, so every malformed header is a
//! connection-fatal protocol error.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{Frame, FrameKind, HEADER_LEN};
use crate::types::{Error, Result, StreamId};

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF (no bytes of the next frame read).
/// `max_payload` caps the accepted payload size.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u32,
) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_u8().await {
        Ok(kind) => header[0] = kind,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    read_exact_or_truncated(reader, &mut header[1..], "frame header").await?;

    let kind = FrameKind::from_u8(header[0])
        .ok_or_else(|| Error::protocol(format!("unknown frame kind: 0x{:02X}", header[0])))?;
    let stream_id = StreamId::new(u32::from_be_bytes([header[1], header[2], header[3], header[4]]));
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    if len > max_payload {
        return Err(Error::protocol(format!(
            "frame too large: {} bytes (max {})",
            len, max_payload
        )));
    }

    let mut payload = vec![0u8; len as usize];
    read_exact_or_truncated(reader, &mut payload, "frame payload").await?;

    Ok(Some(Frame {
        stream_id,
        kind,
        payload: Bytes::from(payload),
    }))
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::protocol(format!("truncated {}", what)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write one frame to the stream. Does not flush; the writer pump flushes
/// once its queue runs dry.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = u32::try_from(frame.payload.len())
        .map_err(|_| Error::internal("frame payload exceeds u32"))?;
    let mut header = [0u8; HEADER_LEN];
    header[0] = frame.kind.as_u8();
    header[1..5].copy_from_slice(&frame.stream_id.get().to_be_bytes());
    header[5..9].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}
