//! Fixed-width integer codec and deadline-bounded stream I/O.
//!
//! Every service framing in the overlay is built from these helpers: all
//! integers on the wire are big-endian, and every read or write is bounded
//! by the per-operation timeout so a stalled peer cannot wedge a task.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Encode an unsigned 32-bit integer using big-endian byte order.
#[inline]
pub fn encode_u32(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Decode an unsigned 32-bit integer using big-endian byte order.
#[inline]
pub fn decode_u32(data: [u8; 4]) -> u32 {
    u32::from_be_bytes(data)
}

/// Encode a signed 64-bit integer using big-endian byte order.
#[inline]
pub fn encode_i64(n: i64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Decode a signed 64-bit integer using big-endian byte order.
#[inline]
pub fn decode_i64(data: [u8; 8]) -> i64 {
    i64::from_be_bytes(data)
}

/// Write `data` to a stream, failing with [`Error::Timeout`] if the
/// deadline elapses first.
pub async fn write_with_timeout<W>(writer: &mut W, data: &[u8], deadline: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(deadline, writer.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout),
    }
}

/// Read exactly `n` bytes from a stream, failing with [`Error::Timeout`]
/// if the deadline elapses first.
pub async fn read_with_timeout<R>(reader: &mut R, n: u32, deadline: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut data = vec![0u8; n as usize];
    match timeout(deadline, reader.read_exact(&mut data)).await {
        Ok(Ok(_)) => Ok(data),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout),
    }
}

/// Read a big-endian unsigned 32-bit integer from a stream.
pub async fn read_u32_with_timeout<R>(reader: &mut R, deadline: Duration) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let data = read_with_timeout(reader, 4, deadline).await?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&data);
    Ok(decode_u32(arr))
}

/// Read a big-endian signed 64-bit integer from a stream.
pub async fn read_i64_with_timeout<R>(reader: &mut R, deadline: Duration) -> Result<i64>
where
    R: AsyncRead + Unpin,
{
    let data = read_with_timeout(reader, 8, deadline).await?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&data);
    Ok(decode_i64(arr))
}

/// Write a length-prefixed frame: `size_be32 || payload`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], deadline: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&encode_u32(payload.len() as u32));
    buf.extend_from_slice(payload);
    write_with_timeout(writer, &buf, deadline).await
}

/// Read a length-prefixed frame, refusing payloads larger than `max`.
pub async fn read_frame<R>(reader: &mut R, max: u32, deadline: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let size = read_u32_with_timeout(reader, deadline).await?;
    if size > max {
        return Err(Error::BufferTooLarge {
            size: size as u64,
            max: max as u64,
        });
    }
    read_with_timeout(reader, size, deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        for n in [0u32, 1, 0xff, 0x1234_5678, u32::MAX] {
            assert_eq!(decode_u32(encode_u32(n)), n);
        }
    }

    #[test]
    fn i64_round_trip() {
        for n in [i64::MIN, -1, 0, 1, 1_500_000_000_000_000_000, i64::MAX] {
            assert_eq!(decode_i64(encode_i64(n)), n);
        }
    }

    #[test]
    fn u32_is_big_endian() {
        assert_eq!(encode_u32(0x0102_0304), [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn read_times_out_on_silent_peer() {
        // A duplex with no writer never yields bytes.
        let (mut reader, _writer) = tokio::io::duplex(64);
        let started = std::time::Instant::now();
        let err = read_with_timeout(&mut reader, 8, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn write_times_out_when_buffer_full() {
        let (mut writer, _reader) = tokio::io::duplex(16);
        // Nobody drains the pipe, so a large write cannot complete.
        let err = write_with_timeout(&mut writer, &[0u8; 4096], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello overlay", Duration::from_secs(1))
            .await
            .unwrap();
        let payload = read_frame(&mut b, 64, Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload, b"hello overlay");
    }

    #[tokio::test]
    async fn frame_rejects_oversized_payload() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[0u8; 128], Duration::from_secs(1))
            .await
            .unwrap();
        let err = read_frame(&mut b, 64, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BufferTooLarge { size: 128, max: 64 }));
    }
}
