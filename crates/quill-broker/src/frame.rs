//! Frame codec
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of JSON.

use quill_common::{ClientError, ClientResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is a protocol violation
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Write one framed message
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)
        .map_err(|e| ClientError::Internal(format!("frame encode failed: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| ClientError::Protocol("frame too large".into()))?;
    if len > MAX_FRAME_LEN {
        return Err(ClientError::Protocol("frame too large".into()));
    }

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(ClientError::transport)?;
    writer.write_all(&body).await.map_err(ClientError::transport)?;
    writer.flush().await.map_err(ClientError::transport)
}

/// Read one framed message; `None` on a clean end-of-stream
pub async fn read_frame<R, T>(reader: &mut R) -> ClientResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ClientError::transport(e)),
    }

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ClientError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ClientError::transport)?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| ClientError::Protocol(format!("malformed frame: {e}")))
}
