//! Process loop: the per-stream artifact consumer.
//!
//! One task per artifact stream read-half. Each iteration reads a
//! 45-byte metadata frame, enforces the acceptance cap, drops duplicate
//! checksums on the floor, and otherwise hands the artifact to the
//! application exactly once, then waits on its closer before reading the
//! next frame. `Ok` keeps the stream; `Disconnect` tears it down.
//!
//! Lock order in the receive path is artifact cache, then witness cache.

use std::io::Cursor;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::artifact::{self, Artifact, CloseSignal, METADATA_LEN};
use crate::client::Inner;
use crate::identity::PeerId;

/// Scratch buffer length for discarding duplicate bodies.
const DISCARD_CHUNK: usize = 8 * 1024;

/// Spawn the artifact process loop on a stream read half.
pub(crate) fn spawn_process<R>(inner: Arc<Inner>, peer: PeerId, recv: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(process(inner, peer, recv));
}

async fn process<R>(inner: Arc<Inner>, peer: PeerId, mut recv: R)
where
    R: AsyncRead + Send + Unpin,
{
    let Some(deliver) = inner.receive_tx.lock().unwrap().clone() else {
        return;
    };

    loop {
        // Idle streams are normal: the metadata read has no deadline.
        let mut metadata = [0u8; METADATA_LEN];
        if let Err(e) = recv.read_exact(&mut metadata).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!(peer = %peer, "disconnecting");
            } else {
                warn!(peer = %peer, error = %e, "cannot read artifact metadata");
            }
            break;
        }

        let (checksum, compression, size, timestamp) = match artifact::decode_metadata(&metadata)
        {
            Ok(fields) => fields,
            Err(e) => {
                warn!(peer = %peer, error = %e, "rejecting malformed artifact metadata");
                break;
            }
        };
        let code = hex::encode(&checksum[..4]);
        debug!(peer = %peer, checksum = %code, size, "receiving artifact");

        if size > inner.config.artifact_max_buffer_size {
            warn!(peer = %peer, checksum = %code, size, "artifact exceeds acceptance cap");
            break;
        }

        // Duplicate suppression; on first sight, record the sender as a
        // witness (artifact cache lock, then witness cache lock).
        let fresh = {
            let mut artifacts = inner.artifact_cache.lock().unwrap();
            if artifacts.get(&checksum).is_some() {
                false
            } else {
                artifacts.put(checksum, size);
                let mut witnesses = inner.witness_cache.lock().unwrap();
                let mut seen = witnesses.get(&checksum).cloned().unwrap_or_default();
                if !seen.contains(&peer) {
                    seen.push(peer);
                }
                witnesses.put(checksum, seen);
                true
            }
        };

        if !fresh {
            if let Err(e) = discard(&mut recv, size).await {
                debug!(peer = %peer, error = %e, "disconnecting");
                break;
            }
            continue;
        }

        let mut body = vec![0u8; size as usize];
        if let Err(e) = recv.read_exact(&mut body).await {
            debug!(peer = %peer, error = %e, "cannot read artifact body");
            break;
        }

        let mut incoming = Artifact::new(Cursor::new(body), checksum, compression, size, timestamp);
        let waiter = incoming
            .take_waiter()
            .expect("freshly built artifact has its waiter");
        if deliver.send(incoming).await.is_err() {
            break;
        }

        // One artifact outstanding per stream: wait for the consumer's
        // verdict before reading the next frame.
        match waiter.await {
            Ok(CloseSignal::Ok) => continue,
            Ok(CloseSignal::Disconnect) | Err(_) => {
                debug!(peer = %peer, "disconnecting");
                break;
            }
        }
    }

    inner.streams.remove(&peer);
}

/// Read and drop exactly `size` bytes.
async fn discard<R: AsyncRead + Unpin>(recv: &mut R, size: u32) -> std::io::Result<()> {
    let mut scratch = [0u8; DISCARD_CHUNK];
    let mut remaining = size as usize;
    while remaining > 0 {
        let want = remaining.min(DISCARD_CHUNK);
        recv.read_exact(&mut scratch[..want]).await?;
        remaining -= want;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discard_consumes_exactly_the_body() {
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        let body = vec![0xabu8; 20_000];
        tokio::io::AsyncWriteExt::write_all(&mut writer, &body)
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"tail")
            .await
            .unwrap();

        discard(&mut reader, 20_000).await.unwrap();
        let mut tail = [0u8; 4];
        reader.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"tail");
    }
}
