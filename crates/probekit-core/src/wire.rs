//! Length-prefixed JSON frames over any async byte stream.
//!
//! Frame layout: 4-byte little-endian payload length, then the JSON payload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ExamError, ExamResult};

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub async fn write_frame<W, T>(stream: &mut W, message: &T) -> ExamResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(ExamError::container(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            data.len()
        )));
    }
    let len = data.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream before a length.
pub async fn read_frame<R, T>(stream: &mut R) -> ExamResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ExamError::container(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}
