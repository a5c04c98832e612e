//! Length-prefixed JSON framing: a 2-byte big-endian length, then the UTF-8 JSON body.
//!
//! Used for the module control socket and for the handshake frame handed to a module's
//! data-port connection before bytes start flowing.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtocolError;

/// Messages longer than this are rejected before allocating a buffer for them.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize `value` to JSON and write it as `len_be16 || json` to `writer`.
///
/// # Errors
/// [`ProtocolError::Json`] if `value` doesn't serialize, [`ProtocolError::FrameTooLarge`]
/// if the encoded body exceeds [`MAX_FRAME_LEN`] or `u16::MAX`, [`ProtocolError::Io`] on
/// a write failure.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN || body.len() > u16::MAX as usize {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u16).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a `len_be16 || json` frame from `reader` and deserialize it as `T`.
///
/// # Errors
/// [`ProtocolError::FrameTooLarge`] if the declared length exceeds [`MAX_FRAME_LEN`],
/// [`ProtocolError::Json`] if the body doesn't deserialize as `T`, [`ProtocolError::Io`]
/// on a read failure (including a clean EOF before any bytes are read).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn write_then_read_frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { n: 7 }).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Ping = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, Ping { n: 7 });
    }

    #[tokio::test]
    async fn read_frame_on_empty_input_is_io_error() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result: Result<Ping, ProtocolError> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn two_frames_written_back_to_back_read_independently() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { n: 1 }).await.unwrap();
        write_frame(&mut buf, &Ping { n: 2 }).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: Ping = read_frame(&mut cursor).await.unwrap();
        let second: Ping = read_frame(&mut cursor).await.unwrap();
        assert_eq!(first, Ping { n: 1 });
        assert_eq!(second, Ping { n: 2 });
    }
}
