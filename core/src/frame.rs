//! Length-prefixed framing over TCP.
//!
//! Wire format: a 4-byte big-endian u32 length, then that many bytes of
//! UTF-8 JSON.  A length of zero or above [`MAX_FRAME`] is a protocol error
//! and the connection must be closed.  A short read of the header or body
//! before EOF is treated as an orderly close.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a frame body, in bytes.
pub const MAX_FRAME: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad frame length: {0}")]
    BadLength(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame payload: {0}")]
    BadJson(#[from] serde_json::Error),
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Write one frame.  The payload must be non-empty and within [`MAX_FRAME`].
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() || payload.len() > MAX_FRAME {
        return Err(FrameError::BadLength(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.  Returns `Ok(None)` when the peer closed the stream
/// before a complete frame arrived.
pub async fn read_frame<R>(reader: &mut R) -> FrameResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(FrameError::BadLength(len));
    }
    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Serialize `value` as compact JSON and send it as one frame.
pub async fn write_json<W>(writer: &mut W, value: &Value) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload).await
}

/// Receive one frame and parse it as JSON.  `Ok(None)` on orderly close.
pub async fn read_json<R>(reader: &mut R) -> FrameResult<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256 * 1024);
        for payload in [&b"x"[..], &[0x7fu8; 17][..], &vec![b'j'; MAX_FRAME][..]] {
            write_frame(&mut a, payload).await.unwrap();
            let got = read_frame(&mut b).await.unwrap().unwrap();
            assert_eq!(got, payload);
        }
    }

    #[tokio::test]
    async fn rejects_empty_and_oversize() {
        let (mut a, _b) = tokio::io::duplex(1024);
        assert!(matches!(
            write_frame(&mut a, b"").await,
            Err(FrameError::BadLength(0))
        ));
        let big = vec![0u8; MAX_FRAME + 1];
        assert!(matches!(
            write_frame(&mut a, &big).await,
            Err(FrameError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn bad_header_length_is_a_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u32(0).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::BadLength(0))
        ));

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u32((MAX_FRAME + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_reads_as_closed() {
        // Header cut short.
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());

        // Body cut short.
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u32(10).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let v = json!({"type": "room_join", "data": {"roomId": 3}});
        write_json(&mut a, &v).await.unwrap();
        assert_eq!(read_json(&mut b).await.unwrap().unwrap(), v);
    }
}
