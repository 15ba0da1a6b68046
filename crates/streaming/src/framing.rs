//! Length-prefixed framing over async byte streams.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use corelib::error::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_PREFIX: usize = 4;

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge {
        len: frame.len(),
        limit: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + frame.len());
    buf.put_u32(len);
    buf.put_slice(frame);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge {
            len,
            limit: max_len,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
