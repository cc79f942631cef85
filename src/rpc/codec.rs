//! Frames are a 4-byte little-endian length followed by the body.

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::MalformedRequest(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    Ok(())
}

fn prefix(len: usize) -> Result<[u8; 4]> {
    check_len(len)?;
    Ok((len as u32).to_le_bytes())
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    check_len(len)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&prefix(body.len())?).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn read_frame_blocking<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    check_len(len)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_frame_blocking<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&prefix(body.len())?)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_blocking_frame() {
        let mut buf = Vec::new();
        write_frame_blocking(&mut buf, b"{\"a\":1}").unwrap();
        assert_eq!(&buf[..4], &[7, 0, 0, 0]);
        let frame = read_frame_blocking(&mut Cursor::new(buf)).unwrap();
        assert_eq!(frame, b"{\"a\":1}");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"junk");
        assert!(matches!(
            read_frame_blocking(&mut Cursor::new(buf)),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let buf = vec![10, 0, 0, 0, b'x'];
        assert!(matches!(
            read_frame_blocking(&mut Cursor::new(buf)),
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_async_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"first");
        assert!(read_frame(&mut b).await.unwrap().is_empty());
    }
}
