//! Peer and stream discovery loops.
//!
//! Both loops share the same cadence: the sleep interval grows
//! exponentially over the first thirty seconds (from about one second up
//! to two minutes), then stays flat at two minutes. Peer discovery
//! replenishes the routing table by sampling known peers; stream
//! discovery tops the outbound stream set up to capacity by pairing with
//! recommended neighbours.
//!
//! A third task re-probes a random sample of peers every refresh period
//! and re-partitions the latency rings from the resulting EWMAs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tracing::debug;

use crate::client::Inner;
use crate::pair;
use crate::peerstore::AddressTtl;
use crate::ping;
use crate::sample;

/// Flat interval once the warm-up window has passed.
const FLAT_INTERVAL: Duration = Duration::from_secs(120);

/// Length of the exponential warm-up window.
const WARMUP: Duration = Duration::from_secs(30);

/// Sleep interval at `elapsed` since loop start: `exp(ln(120)/30 * t)`
/// seconds while inside the warm-up window, then flat.
fn discovery_delay(elapsed: Duration) -> Duration {
    if elapsed >= WARMUP {
        return FLAT_INTERVAL;
    }
    let rate = FLAT_INTERVAL.as_secs_f64().ln() / WARMUP.as_secs_f64();
    let secs = f64::exp(rate * elapsed.as_secs_f64());
    Duration::from_secs_f64(secs.min(FLAT_INTERVAL.as_secs_f64()))
}

/// Spawn the peer discovery loop.
pub(crate) fn spawn_peer_discovery(inner: Arc<Inner>, mut quit: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            tokio::select! {
                _ = &mut quit => break,
                _ = tokio::time::sleep(discovery_delay(started.elapsed())) => {
                    replenish_routing_table(&inner, inner.config.sample_size).await;
                }
            }
        }
    });
}

/// Sample up to `queries` random known peers and fold their samples into
/// the routing table. New peers enter the peer store temporarily, are
/// validated with a ping, and are promoted to permanent on success.
/// Peers we hold no addresses for are dropped from the table.
async fn replenish_routing_table(inner: &Arc<Inner>, mut queries: usize) {
    let mut peers = inner.table.list_peers();
    peers.shuffle(&mut rand::thread_rng());

    for peer in peers {
        if queries == 0 {
            break;
        }
        if inner.peerstore.addrs(&peer).is_empty() {
            inner.table.remove(&peer);
            continue;
        }

        let sample = match sample::sample(inner, peer).await {
            Ok(sample) => sample,
            Err(e) => {
                debug!(peer = %peer, error = %e, "cannot sample peer");
                continue;
            }
        };

        for info in sample {
            if info.id == inner.peer_id || inner.table.contains(&info.id) {
                continue;
            }
            let addrs = info.socket_addrs();
            if addrs.is_empty() {
                continue;
            }
            inner.peerstore.add_addrs(info.id, &addrs, AddressTtl::Temp);
            if ping::ping(inner, info.id).await.is_err() {
                continue;
            }
            inner
                .peerstore
                .set_addrs(info.id, &addrs, AddressTtl::Permanent);
            inner.table.add(info.id);
        }
        queries -= 1;
    }
}

/// Spawn the stream discovery loop.
pub(crate) fn spawn_stream_discovery(inner: Arc<Inner>, mut quit: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            tokio::select! {
                _ = &mut quit => break,
                _ = tokio::time::sleep(discovery_delay(started.elapsed())) => {
                    if inner.streams.outbound_size() < inner.streams.outbound_capacity() {
                        replenish_streamstore(&inner).await;
                    }
                }
            }
        }
    });
}

/// Pair with recommended neighbours until the outbound set is full.
/// Ring recommendations act as the preferred set of the bucket
/// recommendation, balancing the overlay across both partitions.
async fn replenish_streamstore(inner: &Arc<Inner>) {
    let capacity = inner.streams.outbound_capacity();
    let preferred = inner.table.ring_recommend(capacity, &[]);
    let candidates = inner.table.recommend(capacity, &preferred);
    let paired: HashSet<_> = inner.streams.outbound_peers().into_iter().collect();

    for candidate in candidates {
        if inner.streams.outbound_size() >= capacity {
            break;
        }
        if paired.contains(&candidate) {
            continue;
        }
        if inner.peerstore.addrs(&candidate).is_empty() {
            continue;
        }
        if let Err(e) = pair::pair(inner, candidate).await {
            debug!(peer = %candidate, error = %e, "pairing attempt failed");
        }
    }
}

/// Spawn the latency-ring refresh task: re-probe a random sample of
/// peers each period, then re-bucket the rings from the peer store's
/// smoothed latencies.
pub(crate) fn spawn_ring_refresh(inner: Arc<Inner>, mut quit: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut quit => break,
                _ = tokio::time::sleep(inner.config.latency_tolerance) => {
                    for peer in inner.table.random_peers(inner.config.sample_size) {
                        let _ = ping::ping(&inner, peer).await;
                    }
                    inner.table.populate_rings(|peer| inner.peerstore.latency(peer));
                }
            }
        }
    });
}
