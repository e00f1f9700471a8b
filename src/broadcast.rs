//! Broadcast pipeline: the artifact producer.
//!
//! One loop pulls artifacts off the send queue and fans each one out
//! across every outbound stream whose peer has not already witnessed it.
//! The 45-byte metadata frame goes first; the body follows in bounded
//! chunks, and chunk `i` is only written for peers whose chunk `i-1`
//! succeeded; each chunk transaction consumes its peer's previous
//! result before writing. Per-stream writer actors keep the frame bytes
//! contiguous on the wire.
//!
//! Broadcast is best-effort: after the final frame, peers whose last
//! write failed are dropped from the stream store and the artifact is
//! not retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::artifact::{self, Artifact};
use crate::client::Inner;
use crate::codec;
use crate::error::Error;
use crate::identity::PeerId;
use crate::streamstore::{Transaction, TxResult};

/// Spawn the broadcast loop; it owns the send queue's receiving end.
pub(crate) fn spawn_broadcast(inner: Arc<Inner>, mut quit: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        let mut send_rx = inner
            .send_rx
            .lock()
            .await
            .take()
            .expect("broadcast loop starts once");
        loop {
            tokio::select! {
                _ = &mut quit => break,
                outgoing = send_rx.recv() => match outgoing {
                    None => break,
                    Some(outgoing) => broadcast(&inner, outgoing).await,
                },
            }
        }
    });
}

/// Fan one artifact out to every outbound stream not already known to
/// have seen it.
async fn broadcast(inner: &Arc<Inner>, mut outgoing: Artifact) {
    let checksum = outgoing.checksum();
    let size = outgoing.size();
    let deadline = inner.config.timeout;

    inner.artifact_cache.lock().unwrap().put(checksum, size);

    // Witnesses are skipped, not retried later.
    let mut exclude: Vec<PeerId> = inner
        .witness_cache
        .lock()
        .unwrap()
        .get(&checksum)
        .cloned()
        .unwrap_or_default();
    exclude.sort();

    let metadata = Bytes::copy_from_slice(&artifact::encode_metadata(&outgoing));
    let send_metadata: Transaction<quinn::SendStream> = Arc::new(move |_, writer| {
        let metadata = metadata.clone();
        Box::pin(async move { codec::write_with_timeout(writer, &metadata, deadline).await })
    });
    let mut previous = inner.streams.apply(send_metadata, &exclude);

    let chunk_size = inner.config.artifact_chunk_size;
    let mut leftover = size;
    while leftover > 0 {
        let len = leftover.min(chunk_size);
        let mut data = vec![0u8; len as usize];
        if let Err(e) = outgoing.read_exact(&mut data).await {
            warn!(error = %e, "cannot read artifact body");
            outgoing.disconnect();
            return;
        }
        leftover -= len;

        let chunk = Bytes::from(data);
        let prior = Arc::new(Mutex::new(previous));
        let send_chunk: Transaction<quinn::SendStream> = Arc::new(move |peer, writer| {
            let chunk = chunk.clone();
            let prior = prior.clone();
            Box::pin(async move {
                // Only write to peers whose previous frame landed.
                let earlier = prior.lock().unwrap().remove(&peer);
                match earlier {
                    None => Ok(()),
                    Some(receiver) => match receiver.await {
                        Ok(Ok(())) => codec::write_with_timeout(writer, &chunk, deadline).await,
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::StreamClosed),
                    },
                }
            })
        });
        previous = inner.streams.apply(send_chunk, &exclude);
    }

    prune_failures(inner, previous);
    outgoing.close();
}

/// Drop the stream of every peer whose final frame failed.
fn prune_failures(inner: &Arc<Inner>, results: HashMap<PeerId, oneshot::Receiver<TxResult>>) {
    for (peer, receiver) in results {
        let inner = inner.clone();
        tokio::spawn(async move {
            match receiver.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "failed to receive the artifact");
                    inner.streams.remove(&peer);
                }
                Err(_) => inner.streams.remove(&peer),
            }
        });
    }
}
