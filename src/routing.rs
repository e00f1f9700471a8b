//! Routing table: neighbour selection over distance classes.
//!
//! Known peers live in 256 Kademlia-style XOR buckets over SHA-256 of the
//! peer identifier, each bounded by the configured bucket size. Neighbour
//! recommendation spreads its allowance evenly across the occupied
//! buckets rather than concentrating on the closest, keeping the overlay
//! well-connected in every direction of the keyspace.
//!
//! The buckets are augmented by **latency rings**: a partition of the
//! same peers by smoothed round-trip time, with ring boundaries growing
//! geometrically from a base latency. A background task re-probes a
//! random sample of peers per refresh interval and re-populates the
//! rings; ring recommendations feed the bucket recommendation's
//! preferred set so stream discovery balances across both partitions.

use std::sync::Mutex;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::identity::{bucket_index, distance_cmp, xor_distance, PeerId};

/// Number of latency rings.
const RING_COUNT: usize = 9;

/// Boundary of the innermost non-zero ring.
const RING_BASE: Duration = Duration::from_millis(2);

/// Geometric growth factor of the ring boundaries.
const RING_GROWTH: f64 = 2.0;

/// One occupied distance class and its members.
#[derive(Debug, Clone)]
pub struct BucketView {
    pub index: usize,
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    id: PeerId,
    key: [u8; 32],
}

struct TableInner {
    buckets: Vec<Vec<PeerEntry>>,
    rings: Vec<Vec<PeerId>>,
}

/// Bucketed set of known peers with balanced neighbour selection.
pub struct RoutingTable {
    self_id: PeerId,
    self_key: [u8; 32],
    k: usize,
    ring_bounds: Vec<Duration>,
    inner: Mutex<TableInner>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        let mut ring_bounds = Vec::with_capacity(RING_COUNT);
        ring_bounds.push(Duration::ZERO);
        let mut bound = RING_BASE;
        for _ in 1..RING_COUNT {
            ring_bounds.push(bound);
            bound = Duration::from_secs_f64(bound.as_secs_f64() * RING_GROWTH);
        }
        Self {
            self_id,
            self_key: self_id.routing_key(),
            k,
            ring_bounds,
            inner: Mutex::new(TableInner {
                buckets: vec![Vec::new(); 256],
                rings: vec![Vec::new(); RING_COUNT],
            }),
        }
    }

    /// Register a peer. Re-registration refreshes its position; a full
    /// bucket keeps its current occupants.
    pub fn add(&self, peer: PeerId) -> bool {
        if peer == self.self_id || !peer.is_valid() {
            return false;
        }
        let key = peer.routing_key();
        let idx = bucket_index(&self.self_key, &key);
        let mut inner = self.inner.lock().unwrap();
        let bucket = &mut inner.buckets[idx];
        if let Some(pos) = bucket.iter().position(|e| e.id == peer) {
            let entry = bucket.remove(pos);
            bucket.push(entry);
            return true;
        }
        if bucket.len() >= self.k {
            return false;
        }
        bucket.push(PeerEntry { id: peer, key });
        true
    }

    /// Deregister a peer.
    pub fn remove(&self, peer: &PeerId) {
        let idx = bucket_index(&self.self_key, &peer.routing_key());
        let mut inner = self.inner.lock().unwrap();
        inner.buckets[idx].retain(|e| e.id != *peer);
        for ring in &mut inner.rings {
            ring.retain(|p| p != peer);
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let idx = bucket_index(&self.self_key, &peer.routing_key());
        let inner = self.inner.lock().unwrap();
        inner.buckets[idx].iter().any(|e| e.id == *peer)
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.buckets.iter().map(Vec::len).sum()
    }

    pub fn list_peers(&self) -> Vec<PeerId> {
        let inner = self.inner.lock().unwrap();
        inner
            .buckets
            .iter()
            .flatten()
            .map(|e| e.id)
            .collect()
    }

    /// The occupied distance classes and their members.
    pub fn buckets(&self) -> Vec<BucketView> {
        let inner = self.inner.lock().unwrap();
        inner
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(index, b)| BucketView {
                index,
                peers: b.iter().map(|e| e.id).collect(),
            })
            .collect()
    }

    /// Up to `count` peers spread evenly across the occupied buckets,
    /// preferring members of `preferred` and sampling uniformly inside
    /// each bucket for the remainder.
    pub fn recommend(&self, count: usize, preferred: &[PeerId]) -> Vec<PeerId> {
        let inner = self.inner.lock().unwrap();
        let occupied: Vec<&Vec<PeerEntry>> =
            inner.buckets.iter().filter(|b| !b.is_empty()).collect();
        if occupied.is_empty() || count == 0 {
            return Vec::new();
        }

        let mut allowance = vec![0usize; occupied.len()];
        for i in 0..count {
            allowance[i % occupied.len()] += 1;
        }

        let mut rng = rand::thread_rng();
        let mut recommended = Vec::with_capacity(count);
        for (bucket, quota) in occupied.iter().zip(allowance) {
            let mut chosen: Vec<PeerId> = bucket
                .iter()
                .map(|e| e.id)
                .filter(|id| preferred.contains(id))
                .take(quota)
                .collect();
            if chosen.len() < quota {
                let mut rest: Vec<PeerId> = bucket
                    .iter()
                    .map(|e| e.id)
                    .filter(|id| !chosen.contains(id))
                    .collect();
                rest.shuffle(&mut rng);
                chosen.extend(rest.into_iter().take(quota - chosen.len()));
            }
            recommended.extend(chosen);
        }
        recommended
    }

    /// Up to `k` peers biased toward XOR-closeness to `target`, skipping
    /// the sorted `exclude` list.
    pub fn sample_biased(&self, target: &[u8; 32], k: usize, exclude: &[PeerId]) -> Vec<PeerId> {
        let mut candidates: Vec<(PeerId, [u8; 32])> = {
            let inner = self.inner.lock().unwrap();
            inner
                .buckets
                .iter()
                .flatten()
                .filter(|e| exclude.binary_search(&e.id).is_err())
                .map(|e| (e.id, xor_distance(&e.key, target)))
                .collect()
        };
        candidates.sort_by(|a, b| distance_cmp(&a.1, &b.1));

        let mut rng = rand::thread_rng();
        let mut sample = Vec::with_capacity(k.min(candidates.len()));
        while sample.len() < k && !candidates.is_empty() {
            let j = biased_index(candidates.len(), &mut rng);
            sample.push(candidates.remove(j).0);
        }
        sample
    }

    /// A uniform random subset of known peers, used to pick re-probe
    /// targets.
    pub fn random_peers(&self, k: usize) -> Vec<PeerId> {
        let mut peers = self.list_peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(k);
        peers
    }

    /// Re-partition every known peer into latency rings given the current
    /// smoothed latencies. Peers with no observation yet stay out of the
    /// rings.
    pub fn populate_rings(&self, latency_of: impl Fn(&PeerId) -> Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        let peers: Vec<PeerId> = inner.buckets.iter().flatten().map(|e| e.id).collect();
        let mut rings = vec![Vec::new(); RING_COUNT];
        for peer in peers {
            if let Some(latency) = latency_of(&peer) {
                rings[self.ring_of(latency)].push(peer);
            }
        }
        inner.rings = rings;
    }

    /// Up to `count` peers drawn evenly across the occupied latency
    /// rings, preferring members of `preferred`.
    pub fn ring_recommend(&self, count: usize, preferred: &[PeerId]) -> Vec<PeerId> {
        let inner = self.inner.lock().unwrap();
        let occupied: Vec<&Vec<PeerId>> = inner.rings.iter().filter(|r| !r.is_empty()).collect();
        if occupied.is_empty() || count == 0 {
            return Vec::new();
        }

        let mut allowance = vec![0usize; occupied.len()];
        for i in 0..count {
            allowance[i % occupied.len()] += 1;
        }

        let mut rng = rand::thread_rng();
        let mut recommended = Vec::with_capacity(count);
        for (ring, quota) in occupied.iter().zip(allowance) {
            let mut chosen: Vec<PeerId> = ring
                .iter()
                .copied()
                .filter(|id| preferred.contains(id))
                .take(quota)
                .collect();
            if chosen.len() < quota {
                let mut rest: Vec<PeerId> = ring
                    .iter()
                    .copied()
                    .filter(|id| !chosen.contains(id))
                    .collect();
                rest.shuffle(&mut rng);
                chosen.extend(rest.into_iter().take(quota - chosen.len()));
            }
            recommended.extend(chosen);
        }
        recommended
    }

    fn ring_of(&self, latency: Duration) -> usize {
        let mut ring = 0;
        for (i, bound) in self.ring_bounds.iter().enumerate() {
            if latency >= *bound {
                ring = i;
            }
        }
        ring
    }
}

/// Inverse-exponential pick over `n` distance-sorted candidates:
/// `floor(exp(ln(n+1)*u) - 1)` for `u` in `[0,1)`. Probability concentrates on
/// nearer candidates while still reaching the furthest.
fn biased_index(n: usize, rng: &mut impl Rng) -> usize {
    debug_assert!(n > 0);
    let u: f64 = rng.gen();
    let idx = (f64::exp(((n + 1) as f64).ln() * u) - 1.0).floor() as usize;
    idx.min(n - 1)
}
