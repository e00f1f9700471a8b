//! Peer store: addresses and latency observations.
//!
//! Addresses carry a TTL class. `Temp` entries cover unvalidated contact
//! info learned from a sample, `Provider` entries cover addresses handed
//! to us out-of-band, and `Permanent` entries never expire. Expired
//! entries are pruned lazily on read.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Lifetime class of a stored address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressTtl {
    /// Unvalidated, short-lived.
    Temp,
    /// Supplied by a third party.
    Provider,
    /// Never expires.
    Permanent,
}

impl AddressTtl {
    fn duration(self) -> Option<Duration> {
        match self {
            AddressTtl::Temp => Some(Duration::from_secs(2 * 60)),
            AddressTtl::Provider => Some(Duration::from_secs(30 * 60)),
            AddressTtl::Permanent => None,
        }
    }
}

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: SocketAddr,
    ttl: AddressTtl,
    expires: Option<Instant>,
}

impl AddrEntry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires, Some(deadline) if deadline <= now)
    }
}

#[derive(Debug, Default)]
struct PeerRecord {
    addrs: Vec<AddrEntry>,
    latency: Option<Duration>,
}

/// Process-wide registry of peer addresses and latency EWMAs.
#[derive(Debug, Default)]
pub struct PeerStore {
    inner: RwLock<HashMap<PeerId, PeerRecord>>,
}

/// Smoothing factor of the latency EWMA.
const LATENCY_SMOOTHING: f64 = 0.1;

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge addresses for a peer. An address already present keeps the
    /// stronger of the two TTL classes.
    pub fn add_addrs(&self, peer: PeerId, addrs: &[SocketAddr], ttl: AddressTtl) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let record = inner.entry(peer).or_default();
        record.addrs.retain(|e| !e.expired(now));
        for addr in addrs {
            match record.addrs.iter_mut().find(|e| e.addr == *addr) {
                Some(entry) => {
                    if ttl >= entry.ttl {
                        entry.ttl = ttl;
                        entry.expires = ttl.duration().map(|d| now + d);
                    }
                }
                None => record.addrs.push(AddrEntry {
                    addr: *addr,
                    ttl,
                    expires: ttl.duration().map(|d| now + d),
                }),
            }
        }
    }

    /// Replace every stored address for a peer.
    pub fn set_addrs(&self, peer: PeerId, addrs: &[SocketAddr], ttl: AddressTtl) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let record = inner.entry(peer).or_default();
        record.addrs = addrs
            .iter()
            .map(|addr| AddrEntry {
                addr: *addr,
                ttl,
                expires: ttl.duration().map(|d| now + d),
            })
            .collect();
    }

    /// Drop every stored address for a peer, keeping its latency record.
    pub fn clear_addrs(&self, peer: &PeerId) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.get_mut(peer) {
            record.addrs.clear();
        }
    }

    /// The unexpired addresses for a peer.
    pub fn addrs(&self, peer: &PeerId) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        match inner.get_mut(peer) {
            Some(record) => {
                record.addrs.retain(|e| !e.expired(now));
                record.addrs.iter().map(|e| e.addr).collect()
            }
            None => Vec::new(),
        }
    }

    /// Fold a round-trip observation into the peer's latency EWMA.
    pub fn record_latency(&self, peer: PeerId, rtt: Duration) {
        let mut inner = self.inner.write().unwrap();
        let record = inner.entry(peer).or_default();
        record.latency = Some(match record.latency {
            None => rtt,
            Some(prev) => {
                let smoothed = LATENCY_SMOOTHING * rtt.as_secs_f64()
                    + (1.0 - LATENCY_SMOOTHING) * prev.as_secs_f64();
                Duration::from_secs_f64(smoothed)
            }
        });
    }

    /// The smoothed latency observed for a peer, if any.
    pub fn latency(&self, peer: &PeerId) -> Option<Duration> {
        self.inner.read().unwrap().get(peer).and_then(|r| r.latency)
    }
}
