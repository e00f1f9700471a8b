//! Pair service: promoting transport streams to artifact channels.
//!
//! The caller opens a stream and awaits one byte: ACK (0x06) or NAK
//! (0x15). The responder admits the caller iff its XOR bucket has room
//! under the per-bucket inbound target, or the caller is closer than the
//! furthest same-bucket occupant (which is then evicted). On ACK both
//! sides install the write half in their stream store (caller outbound,
//! responder inbound) and spawn the artifact process loop on the read
//! half.
//!
//! The responder commits the stream to its store before acknowledging:
//! the admission pre-check can race another handler for the last slot,
//! and only the store's own add decides. A refused add is NAKed with the
//! handed-back stream; a failed ACK write rolls the entry back out.

use std::sync::Arc;

use tracing::debug;

use crate::client::Inner;
use crate::codec;
use crate::error::Result;
use crate::identity::{bucket_index, distance_cmp, xor_distance, PeerId};
use crate::process;
use crate::streamstore::{Direction, Transaction};
use crate::transport::StreamHandler;

const SERVICE: &str = "pair";

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

/// Request to exchange artifacts with a peer. `Ok(false)` means the
/// peer declined or the local stream store is full.
pub(crate) async fn pair(inner: &Arc<Inner>, peer: PeerId) -> Result<bool> {
    debug!(peer = %peer, "requesting to pair");

    let addrs = inner.peerstore.addrs(&peer);
    let (send, mut recv) = match inner
        .transport
        .dial(peer, &addrs, &inner.protocol(SERVICE))
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            debug!(peer = %peer, error = %e, "cannot reach peer for pairing");
            inner.drop_peer(&peer);
            return Err(e);
        }
    };

    let data = codec::read_with_timeout(&mut recv, 1, inner.config.timeout).await?;
    if data[0] == ACK && inner.streams.add(peer, send, Direction::Outbound).is_ok() {
        debug!(peer = %peer, "ready to exchange artifacts");
        process::spawn_process(inner.clone(), peer, recv);
        Ok(true)
    } else {
        debug!(peer = %peer, "cannot pair");
        Ok(false)
    }
}

async fn reject(
    inner: &Arc<Inner>,
    peer: PeerId,
    mut send: quinn::SendStream,
    reason: &'static str,
) {
    debug!(peer = %peer, reason, "rejecting pair request");
    if let Err(e) = codec::write_with_timeout(&mut send, &[NAK], inner.config.timeout).await {
        debug!(peer = %peer, error = %e, "cannot send rejection");
    }
}

/// Register the pairing handler.
pub(crate) fn register(inner: &Arc<Inner>) {
    let handler: StreamHandler = {
        let inner = inner.clone();
        Arc::new(move |peer, _remote, send, recv| {
            let inner = inner.clone();
            Box::pin(async move {
                debug!(peer = %peer, "received request to pair");

                if !inner.table.contains(&peer) {
                    reject(&inner, peer, send, "peer does not exist in any bucket").await;
                    return;
                }

                // Per-bucket inbound target: capacity dealt evenly across
                // the occupied distance classes.
                let classes = inner.table.buckets().len().max(1);
                let target = inner.streams.inbound_capacity().div_ceil(classes);
                let idx = bucket_index(&inner.routing_key, &peer.routing_key());

                let mut occupants: Vec<PeerId> = inner
                    .streams
                    .inbound_peers()
                    .into_iter()
                    .filter(|p| bucket_index(&inner.routing_key, &p.routing_key()) == idx)
                    .collect();

                if occupants.len() + 1 > target {
                    occupants.push(peer);
                    occupants.sort_by(|a, b| {
                        distance_cmp(
                            &xor_distance(&a.routing_key(), &inner.routing_key),
                            &xor_distance(&b.routing_key(), &inner.routing_key),
                        )
                    });
                    let overflow = occupants.split_off(target);
                    if overflow.contains(&peer) {
                        reject(&inner, peer, send, "closer peers exist in its bucket").await;
                        return;
                    }
                    if let Some(furthest) = overflow.last() {
                        inner.streams.remove(furthest);
                    }
                }

                // Commit the stream before acknowledging; add is the
                // only check that cannot race another handler.
                if let Err(send) = inner.streams.add(peer, send, Direction::Inbound) {
                    reject(&inner, peer, send, "cannot be added to the stream store").await;
                    return;
                }

                // The writer actor owns the stream now, so the
                // acknowledgement goes through it like any other write.
                let deadline = inner.config.timeout;
                let ack: Transaction<quinn::SendStream> = Arc::new(move |_, writer| {
                    Box::pin(async move {
                        codec::write_with_timeout(writer, &[ACK], deadline).await
                    })
                });
                let Some(result) = inner.streams.enqueue(&peer, Direction::Inbound, ack) else {
                    return;
                };
                match result.await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(peer = %peer, "cannot send acknowledgement");
                        inner.streams.remove(&peer);
                        return;
                    }
                }

                debug!(peer = %peer, "ready to exchange artifacts");
                process::spawn_process(inner.clone(), peer, recv);
            })
        })
    };
    inner
        .transport
        .set_stream_handler(inner.protocol(SERVICE), handler);
}
