//! Stream store: the directional registry of artifact streams.
//!
//! Each entry owns the write half of one long-lived peer stream through a
//! **writer actor**: a task that consumes a bounded transaction queue and
//! runs each transaction to completion, one at a time. No other party
//! ever writes to the stream, so bytes appear on the wire in enqueue
//! order and never interleave.
//!
//! [`StreamStore::apply`] is the broadcast fan-out primitive: it enqueues
//! one transaction onto every outbound entry (minus an exclude list) and
//! returns the per-peer result channels immediately; completions are
//! awaited by the caller. A full queue fails that peer's channel with
//! [`Error::QueueFull`] without blocking the others.
//!
//! The registry mutex is held only for lookups and structural mutation,
//! never across I/O.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Result of one write transaction.
pub type TxResult = Result<()>;

/// A write transaction: an async closure run by the stream's writer
/// actor with exclusive access to the write half.
pub type Transaction<W> = Arc<
    dyn for<'a> Fn(PeerId, &'a mut W) -> Pin<Box<dyn Future<Output = TxResult> + Send + 'a>>
        + Send
        + Sync,
>;

struct TxItem<W> {
    query: Transaction<W>,
    result: oneshot::Sender<TxResult>,
}

struct Entry<W> {
    queue: mpsc::Sender<TxItem<W>>,
    quit: oneshot::Sender<()>,
}

struct Inner<W> {
    inbound: HashMap<PeerId, Entry<W>>,
    outbound: HashMap<PeerId, Entry<W>>,
}

/// A thread-safe collection of per-peer stream write halves with
/// separate inbound and outbound capacities.
pub struct StreamStore<W> {
    inbound_capacity: usize,
    outbound_capacity: usize,
    queue_size: usize,
    inner: Mutex<Inner<W>>,
}

impl<W> StreamStore<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(inbound_capacity: usize, outbound_capacity: usize, queue_size: usize) -> Self {
        Self {
            inbound_capacity,
            outbound_capacity,
            queue_size,
            inner: Mutex::new(Inner {
                inbound: HashMap::new(),
                outbound: HashMap::new(),
            }),
        }
    }

    /// Install a stream. An existing same-direction entry for the peer is
    /// closed and replaced; a full directional capacity refuses the
    /// stream and hands it back to the caller.
    pub fn add(&self, peer: PeerId, stream: W, direction: Direction) -> std::result::Result<(), W> {
        let mut inner = self.inner.lock().unwrap();
        let (map, capacity) = match direction {
            Direction::Inbound => (&mut inner.inbound, self.inbound_capacity),
            Direction::Outbound => (&mut inner.outbound, self.outbound_capacity),
        };

        if let Some(existing) = map.remove(&peer) {
            debug!(peer = %peer, ?direction, "replacing stream");
            let _ = existing.quit.send(());
        } else if map.len() >= capacity {
            debug!(peer = %peer, ?direction, "stream store at capacity");
            return Err(stream);
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.queue_size);
        let (quit_tx, quit_rx) = oneshot::channel();
        tokio::spawn(writer_actor(peer, stream, queue_rx, quit_rx));
        map.insert(
            peer,
            Entry {
                queue: queue_tx,
                quit: quit_tx,
            },
        );
        Ok(())
    }

    /// Close and drop the peer's streams in both directions. Idempotent.
    pub fn remove(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.inbound.remove(peer) {
            debug!(peer = %peer, "removing stream");
            let _ = entry.quit.send(());
        }
        if let Some(entry) = inner.outbound.remove(peer) {
            debug!(peer = %peer, "removing stream");
            let _ = entry.quit.send(());
        }
    }

    /// Close and drop every stream.
    pub fn purge(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, entry) in inner.inbound.drain() {
            let _ = entry.quit.send(());
        }
        for (_, entry) in inner.outbound.drain() {
            let _ = entry.quit.send(());
        }
    }

    /// Enqueue one transaction onto every outbound entry except those in
    /// the sorted `exclude` list, returning the per-peer result channels
    /// after enqueue. Peers whose writer queue is full fail immediately
    /// with [`Error::QueueFull`].
    pub fn apply(
        &self,
        transaction: Transaction<W>,
        exclude_sorted: &[PeerId],
    ) -> HashMap<PeerId, oneshot::Receiver<TxResult>> {
        let inner = self.inner.lock().unwrap();
        let mut results = HashMap::with_capacity(inner.outbound.len());
        for (peer, entry) in &inner.outbound {
            if exclude_sorted.binary_search(peer).is_ok() {
                continue;
            }
            let (result_tx, result_rx) = oneshot::channel();
            let item = TxItem {
                query: transaction.clone(),
                result: result_tx,
            };
            match entry.queue.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    debug!(peer = %peer, "writer queue full");
                    let _ = item.result.send(Err(Error::QueueFull));
                }
                Err(TrySendError::Closed(item)) => {
                    let _ = item.result.send(Err(Error::StreamClosed));
                }
            }
            results.insert(*peer, result_rx);
        }
        results
    }

    /// Enqueue one transaction onto a single entry's writer actor. `None`
    /// means no such entry exists; queue-full and closed-actor failures
    /// surface on the returned channel like [`apply`](Self::apply).
    pub fn enqueue(
        &self,
        peer: &PeerId,
        direction: Direction,
        transaction: Transaction<W>,
    ) -> Option<oneshot::Receiver<TxResult>> {
        let inner = self.inner.lock().unwrap();
        let map = match direction {
            Direction::Inbound => &inner.inbound,
            Direction::Outbound => &inner.outbound,
        };
        let entry = map.get(peer)?;
        let (result_tx, result_rx) = oneshot::channel();
        let item = TxItem {
            query: transaction,
            result: result_tx,
        };
        match entry.queue.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let _ = item.result.send(Err(Error::QueueFull));
            }
            Err(TrySendError::Closed(item)) => {
                let _ = item.result.send(Err(Error::StreamClosed));
            }
        }
        Some(result_rx)
    }

    pub fn inbound_size(&self) -> usize {
        self.inner.lock().unwrap().inbound.len()
    }

    pub fn outbound_size(&self) -> usize {
        self.inner.lock().unwrap().outbound.len()
    }

    pub fn inbound_capacity(&self) -> usize {
        self.inbound_capacity
    }

    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    pub fn inbound_peers(&self) -> Vec<PeerId> {
        self.inner.lock().unwrap().inbound.keys().copied().collect()
    }

    pub fn outbound_peers(&self) -> Vec<PeerId> {
        self.inner.lock().unwrap().outbound.keys().copied().collect()
    }
}

/// Owns a stream write half; runs queued transactions sequentially until
/// told to quit or the queue closes, then shuts the stream down.
async fn writer_actor<W>(
    peer: PeerId,
    mut stream: W,
    mut queue: mpsc::Receiver<TxItem<W>>,
    mut quit: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = &mut quit => break,
            item = queue.recv() => match item {
                None => break,
                Some(item) => {
                    let result = (item.query)(peer, &mut stream).await;
                    let _ = item.result.send(result);
                }
            },
        }
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::codec;
    use crate::identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate().peer_id()
    }

    fn store(inbound: usize, outbound: usize, queue: usize) -> StreamStore<DuplexStream> {
        StreamStore::new(inbound, outbound, queue)
    }

    fn write_tx(data: &'static [u8]) -> Transaction<DuplexStream> {
        Arc::new(move |_, writer| {
            Box::pin(async move {
                codec::write_with_timeout(writer, data, Duration::from_secs(1)).await
            })
        })
    }

    #[tokio::test]
    async fn capacity_is_enforced_per_direction() {
        let store = store(1, 2, 8);
        let (a, _ka) = tokio::io::duplex(64);
        let (b, _kb) = tokio::io::duplex(64);
        let (c, _kc) = tokio::io::duplex(64);
        let (d, _kd) = tokio::io::duplex(64);

        assert!(store.add(peer(), a, Direction::Outbound).is_ok());
        assert!(store.add(peer(), b, Direction::Outbound).is_ok());
        // The refused stream comes back to the caller.
        assert!(store.add(peer(), c, Direction::Outbound).is_err());
        assert_eq!(store.outbound_size(), 2);

        assert!(store.add(peer(), d, Direction::Inbound).is_ok());
        assert_eq!(store.inbound_size(), 1);
        assert!(store.outbound_size() <= store.outbound_capacity());
        assert!(store.inbound_size() <= store.inbound_capacity());
    }

    #[tokio::test]
    async fn same_direction_add_replaces() {
        let store = store(4, 4, 8);
        let p = peer();
        let (a, _ka) = tokio::io::duplex(64);
        let (b, _kb) = tokio::io::duplex(64);
        assert!(store.add(p, a, Direction::Outbound).is_ok());
        assert!(store.add(p, b, Direction::Outbound).is_ok());
        assert_eq!(store.outbound_size(), 1);
    }

    #[tokio::test]
    async fn apply_reaches_every_outbound_peer() {
        let store = store(4, 4, 8);
        let p1 = peer();
        let p2 = peer();
        let (a, mut read_a) = tokio::io::duplex(256);
        let (b, mut read_b) = tokio::io::duplex(256);
        store.add(p1, a, Direction::Outbound).unwrap();
        store.add(p2, b, Direction::Outbound).unwrap();

        let results = store.apply(write_tx(b"ping"), &[]);
        assert_eq!(results.len(), 2);
        for (_, rx) in results {
            rx.await.unwrap().unwrap();
        }
        let mut buf = [0u8; 4];
        read_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        read_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn apply_honors_exclude_list() {
        let store = store(4, 4, 8);
        let p1 = peer();
        let p2 = peer();
        let (a, _ra) = tokio::io::duplex(256);
        let (b, _rb) = tokio::io::duplex(256);
        store.add(p1, a, Direction::Outbound).unwrap();
        store.add(p2, b, Direction::Outbound).unwrap();

        let mut exclude = vec![p1];
        exclude.sort();
        let results = store.apply(write_tx(b"x"), &exclude);
        assert_eq!(results.len(), 1);
        assert!(results.contains_key(&p2));
    }

    #[tokio::test]
    async fn writes_are_serialised_in_enqueue_order() {
        let store = store(4, 4, 32);
        let p = peer();
        let (a, mut read_a) = tokio::io::duplex(4096);
        store.add(p, a, Direction::Outbound).unwrap();

        for tx in [write_tx(b"first|"), write_tx(b"second|"), write_tx(b"third|")] {
            for (_, rx) in store.apply(tx, &[]) {
                rx.await.unwrap().unwrap();
            }
        }
        let mut buf = vec![0u8; b"first|second|third|".len()];
        read_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"first|second|third|");
    }

    #[tokio::test]
    async fn full_queue_fails_fast_with_queue_full() {
        let store = store(4, 4, 1);
        let p = peer();
        let (a, _ra) = tokio::io::duplex(64);
        store.add(p, a, Direction::Outbound).unwrap();

        // A gated transaction parks the actor so the queue backs up.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate_rx)));
        let blocking: Transaction<DuplexStream> = Arc::new(move |_, _| {
            let gate = gate.clone();
            Box::pin(async move {
                let rx = gate.lock().unwrap().take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(())
            })
        });

        let first = store.apply(blocking, &[]);
        tokio::task::yield_now().await;
        let second = store.apply(write_tx(b"queued"), &[]);
        let third = store.apply(write_tx(b"overflow"), &[]);

        let err = third.into_values().next().unwrap().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        gate_tx.send(()).unwrap();
        for results in [first, second] {
            for (_, rx) in results {
                rx.await.unwrap().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn enqueue_targets_one_entry() {
        let store = store(4, 4, 8);
        let inbound_peer = peer();
        let outbound_peer = peer();
        let (a, mut read_a) = tokio::io::duplex(256);
        let (b, mut read_b) = tokio::io::duplex(256);
        store.add(inbound_peer, a, Direction::Inbound).unwrap();
        store.add(outbound_peer, b, Direction::Outbound).unwrap();

        let result = store
            .enqueue(&inbound_peer, Direction::Inbound, write_tx(b"ack"))
            .expect("entry exists");
        result.await.unwrap().unwrap();

        let mut buf = [0u8; 3];
        read_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ack");

        // The outbound entry saw nothing, and unknown peers are None.
        let mut probe = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(50), read_b.read_exact(&mut probe))
                .await
                .is_err()
        );
        assert!(store
            .enqueue(&peer(), Direction::Inbound, write_tx(b"x"))
            .is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_the_stream() {
        let store = store(4, 4, 8);
        let p = peer();
        let (a, mut read_a) = tokio::io::duplex(64);
        store.add(p, a, Direction::Outbound).unwrap();
        store.remove(&p);
        store.remove(&p);
        assert_eq!(store.outbound_size(), 0);

        // The actor shut the write half down, so the read half sees EOF.
        let mut buf = [0u8; 1];
        assert_eq!(read_a.read(&mut buf).await.unwrap(), 0);

        let results = store.apply(write_tx(b"x"), &[]);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn purge_empties_both_directions() {
        let store = store(4, 4, 8);
        let (a, _ra) = tokio::io::duplex(64);
        let (b, _rb) = tokio::io::duplex(64);
        store.add(peer(), a, Direction::Outbound).unwrap();
        store.add(peer(), b, Direction::Inbound).unwrap();
        store.purge();
        assert_eq!(store.outbound_size(), 0);
        assert_eq!(store.inbound_size(), 0);
    }
}
