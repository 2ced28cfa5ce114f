use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PeriodicError, Result};

/// Magic prefix on frames sent to the server.
pub const MAGIC_REQUEST: [u8; 4] = *b"\x00REQ";
/// Magic prefix on frames sent by the server.
pub const MAGIC_RESPONSE: [u8; 4] = *b"\x00RES";

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, magic: [u8; 4], max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..]).await?;

    if header[..4] != magic {
        return Err(PeriodicError::Protocol(format!(
            "bad frame magic {:?}",
            &header[..4]
        )));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_size {
        return Err(PeriodicError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_size
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, magic: [u8; 4], body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| PeriodicError::Protocol(format!("frame of {} bytes too large", body.len())))?;
    let mut buf = Vec::with_capacity(body.len() + 8);
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, MAGIC_REQUEST, b"hello").await.unwrap();
        write_frame(&mut a, MAGIC_REQUEST, b"").await.unwrap();
        drop(a);

        let first = read_frame(&mut b, MAGIC_REQUEST, 1024).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"hello"[..]));
        let second = read_frame(&mut b, MAGIC_REQUEST, 1024).await.unwrap();
        assert_eq!(second.as_deref(), Some(&b""[..]));
        assert!(read_frame(&mut b, MAGIC_REQUEST, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_magic_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, MAGIC_RESPONSE, b"x").await.unwrap();
        let err = read_frame(&mut b, MAGIC_REQUEST, 1024).await.unwrap_err();
        assert!(matches!(err, PeriodicError::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, MAGIC_REQUEST, &[0u8; 64]).await.unwrap();
        let err = read_frame(&mut b, MAGIC_REQUEST, 16).await.unwrap_err();
        assert!(matches!(err, PeriodicError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&MAGIC_REQUEST).await.unwrap();
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b, MAGIC_REQUEST, 1024).await.unwrap_err();
        assert!(matches!(err, PeriodicError::Io(_)));
    }
}
