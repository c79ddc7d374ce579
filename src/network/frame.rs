//! Length-prefixed framing over a byte stream.
//!
//! Every message on the wire is a 4-byte big-endian size followed by
//! that many bytes of payload. Reads and writes here are `read_exact` /
//! `write_all` based so a frame is always consumed or produced whole.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Await one complete frame and return its payload.
///
/// A negative size or one above `max_frame_bytes` is a protocol fault
/// and fails the stream rather than being skipped.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<BytesMut> {
    let mut size = [0u8; 4];
    reader
        .read_exact(&mut size)
        .await
        .map_err(|e| Error::IoError(e.kind()))?;

    let length = i32::from_be_bytes(size);
    if length < 0 || length as usize > max_frame_bytes {
        return Err(Error::FrameOversize {
            length: length as i64,
            limit: max_frame_bytes,
        });
    }

    tracing::trace!("Reading {} bytes", length);
    let mut payload = BytesMut::zeroed(length as usize);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::IoError(e.kind()))?;
    Ok(payload)
}

/// Write one complete frame, size prefix included, and flush.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    tracing::trace!("Sending bytes {}", frame.len());
    writer
        .write_all(frame)
        .await
        .map_err(|e| Error::IoError(e.kind()))?;
    writer.flush().await.map_err(|e| Error::IoError(e.kind()))?;
    Ok(())
}
