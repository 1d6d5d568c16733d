//! Length-prefixed JSON frame codec.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of UTF-8 JSON. Bulk read payloads travel as a raw byte tail after the
//! header frame, outside the length prefix.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted JSON frame. Larger frames are a protocol violation
/// and close the connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Framing failures. Any of these ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge { len: usize },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON frame")]
    Json(#[from] serde_json::Error),
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge { len });
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(payload),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len: payload.len(),
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and decodes one JSON frame.
pub async fn read_json<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encodes and writes one JSON frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload).await
}

/// Writes a raw payload tail (no length prefix).
pub async fn write_raw<W>(writer: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly `len` raw bytes following a `data_len` header, retrying
/// partial reads until the payload is consumed.
pub async fn read_raw<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut data = vec![0u8; len];
    match reader.read_exact(&mut data).await {
        Ok(_) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_json(&mut client, &json!({"cmd": "hello", "id": 7}))
            .await
            .unwrap();

        let value: serde_json::Value = read_json(&mut server).await.unwrap();
        assert_eq!(value["cmd"], "hello");
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus_len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus_len)
            .await
            .unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn eof_reads_as_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(read_frame(&mut server).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn binary_tail_follows_header() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = b"raw piece data";
        write_json(&mut client, &json!({"ok": true, "data_len": payload.len()}))
            .await
            .unwrap();
        write_raw(&mut client, payload).await.unwrap();

        let header: serde_json::Value = read_json(&mut server).await.unwrap();
        let len = header["data_len"].as_u64().unwrap() as usize;
        let data = read_raw(&mut server, len).await.unwrap();
        assert_eq!(data, payload);
    }
}
