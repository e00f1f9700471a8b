//! Sample service: routing-table gossip.
//!
//! The responder selects a handful of peers from its routing table,
//! biased toward XOR-closeness to the caller, enriches each with
//! peer-store addresses, and sends the list as length-prefixed JSON. The
//! caller seeds its own routing table from the result.

use std::sync::Arc;

use tracing::debug;

use crate::client::Inner;
use crate::codec;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::messages::PeerInfo;
use crate::peerstore::AddressTtl;
use crate::transport::StreamHandler;

const SERVICE: &str = "sample";

/// Get a random sample of peers from the routing table of a peer.
pub(crate) async fn sample(inner: &Arc<Inner>, peer: PeerId) -> Result<Vec<PeerInfo>> {
    let addrs = inner.peerstore.addrs(&peer);
    let (_send, mut recv) = match inner
        .transport
        .dial(peer, &addrs, &inner.protocol(SERVICE))
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            debug!(peer = %peer, error = %e, "cannot reach peer for sampling");
            inner.drop_peer(&peer);
            return Err(e);
        }
    };

    let data = codec::read_frame(
        &mut recv,
        inner.config.sample_max_buffer_size,
        inner.config.timeout,
    )
    .await?;

    let sample: Vec<PeerInfo> = serde_json::from_slice(&data).map_err(|e| {
        debug!(peer = %peer, error = %e, "cannot decode peer sample");
        Error::CorruptData
    })?;
    Ok(sample)
}

/// Register the sampling handler.
pub(crate) fn register(inner: &Arc<Inner>) {
    let handler: StreamHandler = {
        let inner = inner.clone();
        Arc::new(move |peer, remote, mut send, _recv| {
            let inner = inner.clone();
            Box::pin(async move {
                debug!(peer = %peer, "received request for peers");
                inner
                    .peerstore
                    .add_addrs(peer, &[remote], AddressTtl::Provider);

                // Bias the selection toward peers close to the caller so
                // its routing table fills the right buckets.
                let mut exclude = vec![inner.peer_id, peer];
                exclude.sort();
                let candidates = inner.table.sample_biased(
                    &peer.routing_key(),
                    inner.config.sample_size,
                    &exclude,
                );

                let mut sample = Vec::with_capacity(candidates.len());
                for candidate in candidates {
                    let addrs = inner.peerstore.addrs(&candidate);
                    if addrs.is_empty() {
                        continue;
                    }
                    sample.push(PeerInfo::new(candidate, addrs));
                }

                let data = match serde_json::to_vec(&sample) {
                    Ok(data) => data,
                    Err(e) => {
                        debug!(error = %e, "cannot encode peer sample");
                        return;
                    }
                };
                if let Err(e) =
                    codec::write_frame(&mut send, &data, inner.config.timeout).await
                {
                    debug!(peer = %peer, error = %e, "cannot send peer sample");
                    return;
                }
                inner.table.add(peer);
            })
        })
    };
    inner
        .transport
        .set_stream_handler(inner.protocol(SERVICE), handler);
}
