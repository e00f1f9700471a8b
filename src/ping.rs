//! Ping service: reachability probe and latency measurement.
//!
//! The caller writes a fixed number of random bytes and expects the same
//! bytes back. A mismatch is `CorruptData`; success records the round
//! trip in the peer store's latency EWMA. Any failure clears the remote's
//! addresses and drops it from the routing table.

use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use tracing::debug;

use crate::client::Inner;
use crate::codec;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::peerstore::AddressTtl;
use crate::transport::StreamHandler;

const SERVICE: &str = "ping";

/// Ping a peer.
pub(crate) async fn ping(inner: &Arc<Inner>, peer: PeerId) -> Result<()> {
    let result = ping_inner(inner, peer).await;
    if let Err(e) = &result {
        debug!(peer = %peer, error = %e, "ping failed");
        inner.drop_peer(&peer);
    }
    result
}

async fn ping_inner(inner: &Arc<Inner>, peer: PeerId) -> Result<()> {
    let addrs = inner.peerstore.addrs(&peer);
    let (mut send, mut recv) = inner
        .transport
        .dial(peer, &addrs, &inner.protocol(SERVICE))
        .await?;

    let mut wbuf = vec![0u8; inner.config.ping_buffer_size as usize];
    rand::thread_rng().fill_bytes(&mut wbuf);

    let before = Instant::now();
    codec::write_with_timeout(&mut send, &wbuf, inner.config.timeout).await?;
    let rbuf = codec::read_with_timeout(
        &mut recv,
        inner.config.ping_buffer_size,
        inner.config.timeout,
    )
    .await?;

    if wbuf != rbuf {
        return Err(Error::CorruptData);
    }

    inner.peerstore.record_latency(peer, before.elapsed());
    inner.table.add(peer);
    Ok(())
}

/// Register the ping handler.
pub(crate) fn register(inner: &Arc<Inner>) {
    let handler: StreamHandler = {
        let inner = inner.clone();
        Arc::new(move |peer, remote, mut send, mut recv| {
            let inner = inner.clone();
            Box::pin(async move {
                debug!(peer = %peer, "pong");
                let rbuf = match codec::read_with_timeout(
                    &mut recv,
                    inner.config.ping_buffer_size,
                    inner.config.timeout,
                )
                .await
                {
                    Ok(buf) => buf,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "cannot receive ping payload");
                        return;
                    }
                };
                if let Err(e) =
                    codec::write_with_timeout(&mut send, &rbuf, inner.config.timeout).await
                {
                    debug!(peer = %peer, error = %e, "cannot echo ping payload");
                    return;
                }
                // Peers dial from their listening socket, so the observed
                // address is their contact address.
                inner
                    .peerstore
                    .add_addrs(peer, &[remote], AddressTtl::Provider);
                inner.table.add(peer);
            })
        })
    };
    inner
        .transport
        .set_stream_handler(inner.protocol(SERVICE), handler);
}
