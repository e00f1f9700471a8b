//! Artifacts: the opaque blobs the overlay disseminates.
//!
//! An artifact is an immutable value carrying the SHA-256 checksum of its
//! *uncompressed* payload, a compression flag, the on-wire body length, a
//! UTC timestamp in nanoseconds, a reader yielding exactly `size` bytes,
//! and a one-shot closer. The consumer signals the closer exactly once
//! ([`CloseSignal::Ok`] or [`CloseSignal::Disconnect`]) and the producer's
//! process loop waits on it to decide whether to keep the inbound stream.
//!
//! On the wire an artifact is a 45-byte metadata record followed by the
//! body:
//!
//! ```text
//! checksum[32] || compression[1] || size_be32[4] || timestamp_be64[8]
//! ```
//!
//! When the compression flag is set the body is the gzip-compressed
//! payload and `size` is the compressed length; the receiver inflates
//! before verifying the checksum.

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::oneshot;

use crate::codec;
use crate::error::{Error, Result};

/// Length of the encoded artifact metadata record.
pub const METADATA_LEN: usize = 45;

/// The one-shot verdict a consumer passes back through an artifact's
/// closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSignal {
    /// The artifact was consumed successfully; keep the stream.
    Ok,
    /// The artifact was invalid; disconnect from its sender.
    Disconnect,
}

/// An opaque checksummed, optionally gzip-compressed, timestamped blob.
pub struct Artifact {
    checksum: [u8; 32],
    compression: bool,
    size: u32,
    timestamp: i64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    closer: Option<oneshot::Sender<CloseSignal>>,
    waiter: Option<oneshot::Receiver<CloseSignal>>,
}

impl Artifact {
    /// Wrap a reader that yields exactly `size` bytes of on-wire body.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        checksum: [u8; 32],
        compression: bool,
        size: u32,
        timestamp: i64,
    ) -> Self {
        let (closer, waiter) = oneshot::channel();
        Self {
            checksum,
            compression,
            size,
            timestamp,
            reader: Box::new(reader),
            closer: Some(closer),
            waiter: Some(waiter),
        }
    }

    /// Create an artifact from a payload, deriving checksum, size, and
    /// timestamp. With `compress` the on-wire body is the gzip form of
    /// `data` at the fastest compression level.
    pub fn from_bytes(data: &[u8], compress: bool) -> Result<Self> {
        let checksum: [u8; 32] = Sha256::digest(data).into();
        let body = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            std::io::Write::write_all(&mut encoder, data)?;
            encoder.finish()?
        } else {
            data.to_vec()
        };
        let size = u32::try_from(body.len()).map_err(|_| Error::BufferTooLarge {
            size: body.len() as u64,
            max: u32::MAX as u64,
        })?;
        Ok(Self::new(
            Cursor::new(body),
            checksum,
            compress,
            size,
            now_nanos(),
        ))
    }

    /// Purported checksum of the uncompressed payload.
    pub fn checksum(&self) -> [u8; 32] {
        self.checksum
    }

    /// Whether the on-wire body is gzip-compressed.
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Purported on-wire body length.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Purported creation time, nanoseconds since the Unix epoch (UTC).
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Signal the closer with `Ok` without consuming the body.
    pub fn close(mut self) {
        self.signal(CloseSignal::Ok);
    }

    /// Signal the closer with `Disconnect` without consuming the body.
    pub fn disconnect(mut self) {
        self.signal(CloseSignal::Disconnect);
    }

    /// Consume the artifact: read exactly `size` bytes, inflate if
    /// compressed, and verify the checksum. On success the closer is
    /// signalled `Ok` and the payload returned; a short body or checksum
    /// mismatch signals `Disconnect`.
    pub async fn to_bytes(mut self) -> Result<Vec<u8>> {
        let mut wire = vec![0u8; self.size as usize];
        if let Err(e) = self.reader.read_exact(&mut wire).await {
            self.signal(CloseSignal::Disconnect);
            return Err(Error::Io(e));
        }

        let payload = if self.compression {
            let mut decoder = GzDecoder::new(&wire[..]);
            let mut out = Vec::new();
            match std::io::Read::read_to_end(&mut decoder, &mut out) {
                Ok(_) => out,
                Err(e) => {
                    self.signal(CloseSignal::Disconnect);
                    return Err(Error::Io(e));
                }
            }
        } else {
            wire
        };

        let digest: [u8; 32] = Sha256::digest(&payload).into();
        if digest != self.checksum {
            self.signal(CloseSignal::Disconnect);
            return Err(Error::ChecksumMismatch);
        }
        self.signal(CloseSignal::Ok);
        Ok(payload)
    }

    /// Take the receiving end of the closer. The process loop holds it
    /// while the application consumes the artifact.
    pub(crate) fn take_waiter(&mut self) -> Option<oneshot::Receiver<CloseSignal>> {
        self.waiter.take()
    }

    fn signal(&mut self, signal: CloseSignal) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(signal);
        }
    }
}

// The artifact body is consumed through the artifact itself, mirroring
// how the broadcast pipeline drains it chunk by chunk.
impl AsyncRead for Artifact {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("checksum", &hex::encode(&self.checksum[..4]))
            .field("compression", &self.compression)
            .field("size", &self.size)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Encode an artifact's 45-byte metadata record.
pub fn encode_metadata(artifact: &Artifact) -> [u8; METADATA_LEN] {
    let mut out = [0u8; METADATA_LEN];
    out[..32].copy_from_slice(&artifact.checksum);
    out[32] = artifact.compression as u8;
    out[33..37].copy_from_slice(&codec::encode_u32(artifact.size));
    out[37..45].copy_from_slice(&codec::encode_i64(artifact.timestamp));
    out
}

/// Decode a 45-byte metadata record into
/// `(checksum, compression, size, timestamp)`. Any compression flag other
/// than `0x00` or `0x01` is rejected.
pub fn decode_metadata(data: &[u8; METADATA_LEN]) -> Result<([u8; 32], bool, u32, i64)> {
    let mut checksum = [0u8; 32];
    checksum.copy_from_slice(&data[..32]);
    let compression = match data[32] {
        0x00 => false,
        0x01 => true,
        _ => return Err(Error::CorruptData),
    };
    let mut size_buf = [0u8; 4];
    size_buf.copy_from_slice(&data[33..37]);
    let mut ts_buf = [0u8; 8];
    ts_buf.copy_from_slice(&data[37..45]);
    Ok((
        checksum,
        compression,
        codec::decode_u32(size_buf),
        codec::decode_i64(ts_buf),
    ))
}

/// Current wall time as nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
