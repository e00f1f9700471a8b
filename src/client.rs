//! High-level client: the public handle over the overlay engine.
//!
//! A [`Client`] owns the transport, the routing table, the stream store,
//! the caches, and the maintenance loops. Construction validates the
//! configuration, derives the Ed25519 identity, binds the listener,
//! registers the service handlers, greets the seed nodes, and starts the
//! enabled loops. [`Client::shutdown`] stops the loops in reverse start
//! order, purges the stream store, and closes the endpoint.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::auth::{self, AuthHandlers};
use crate::broadcast;
use crate::config::Config;
use crate::discovery;
use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId};
use crate::messages;
use crate::nat::{self, PortMapper};
use crate::peerstore::{AddressTtl, PeerStore};
use crate::ping;
use crate::routing::RoutingTable;
use crate::sample;
use crate::streamstore::StreamStore;
use crate::transport::Transport;
use crate::{analytics, pair};

/// Attempts made to greet each seed node.
const SEED_GREETING_ATTEMPTS: u32 = 5;

/// Pause between seed greeting attempts.
const SEED_GREETING_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) peer_id: PeerId,
    pub(crate) routing_key: [u8; 32],
    pub(crate) protocol_prefix: String,
    pub(crate) listen_addr: SocketAddr,
    pub(crate) transport: Transport,
    pub(crate) peerstore: PeerStore,
    pub(crate) table: RoutingTable,
    pub(crate) streams: StreamStore<quinn::SendStream>,
    pub(crate) artifact_cache: Mutex<LruCache<[u8; 32], u32>>,
    pub(crate) witness_cache: Mutex<LruCache<[u8; 32], Vec<PeerId>>>,
    pub(crate) spammer_cache: Mutex<LruCache<PeerId, Instant>>,
    pub(crate) auth_handlers: RwLock<AuthHandlers>,
    pub(crate) send_tx: mpsc::Sender<Artifact>,
    pub(crate) send_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Artifact>>>,
    pub(crate) receive_tx: Mutex<Option<mpsc::Sender<Artifact>>>,
    pub(crate) receive_rx: tokio::sync::Mutex<mpsc::Receiver<Artifact>>,
    pub(crate) shutting_down: AtomicBool,
}

impl Inner {
    /// Full protocol id for a service on this network.
    pub(crate) fn protocol(&self, service: &str) -> String {
        format!("{}/{}", self.protocol_prefix, service)
    }

    /// Forget a peer that proved unreachable.
    pub(crate) fn drop_peer(&self, peer: &PeerId) {
        self.peerstore.clear_addrs(peer);
        self.table.remove(peer);
    }
}

type ShutdownHook = (&'static str, oneshot::Sender<()>);

/// A running overlay client.
pub struct Client {
    inner: Arc<Inner>,
    hooks: Mutex<Vec<ShutdownHook>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_id", &self.inner.peer_id)
            .finish_non_exhaustive()
    }
}

/// Builder for construction-time collaborators the plain config cannot
/// carry.
pub struct ClientBuilder {
    config: Config,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

impl ClientBuilder {
    /// Supply the port-mapping device consulted by the NAT monitor.
    pub fn port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = Some(mapper);
        self
    }

    /// Validate, bind, bootstrap, and start the maintenance loops.
    pub async fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;

        let keypair = match config.seed_bytes() {
            Some(seed) => Keypair::from_seed(&seed),
            None => Keypair::generate(),
        };
        let peer_id = keypair.peer_id();

        let ip = config.ip.parse().expect("IP address was validated");
        let bind = SocketAddr::new(ip, config.port);
        let transport = Transport::new(&keypair, bind, &config.network, config.timeout)?;
        let listen_addr = transport.local_addr()?;

        let (send_tx, send_rx) = mpsc::channel(config.artifact_queue_size);
        let (receive_tx, receive_rx) = mpsc::channel(config.artifact_queue_size);

        let cache = |size: usize| NonZeroUsize::new(size).expect("cache size was validated");

        let inner = Arc::new(Inner {
            peer_id,
            routing_key: peer_id.routing_key(),
            protocol_prefix: config.protocol_prefix(),
            listen_addr,
            transport,
            peerstore: PeerStore::new(),
            table: RoutingTable::new(peer_id, config.k_bucket_size),
            streams: StreamStore::new(
                config.streamstore_inbound_capacity,
                config.streamstore_outbound_capacity,
                config.streamstore_queue_size,
            ),
            artifact_cache: Mutex::new(LruCache::new(cache(config.artifact_cache_size))),
            witness_cache: Mutex::new(LruCache::new(cache(config.witness_cache_size))),
            spammer_cache: Mutex::new(LruCache::new(cache(config.spammer_cache_size))),
            auth_handlers: RwLock::new(AuthHandlers::default()),
            send_tx,
            send_rx: tokio::sync::Mutex::new(Some(send_rx)),
            receive_tx: Mutex::new(Some(receive_tx)),
            receive_rx: tokio::sync::Mutex::new(receive_rx),
            shutting_down: AtomicBool::new(false),
            config,
        });

        inner
            .peerstore
            .add_addrs(peer_id, &[listen_addr], AddressTtl::Permanent);
        info!(
            "I am {}",
            messages::to_multiaddr_with_peer(&listen_addr, &peer_id)
        );

        ping::register(&inner);
        sample::register(&inner);
        pair::register(&inner);
        auth::register(&inner);
        inner.transport.start_accept();

        greet_seed_nodes(&inner).await;

        let mut hooks: Vec<ShutdownHook> = Vec::new();
        let mut hook = |name: &'static str| {
            let (tx, rx) = oneshot::channel();
            hooks.push((name, tx));
            rx
        };

        if !inner.config.disable_peer_discovery {
            discovery::spawn_peer_discovery(inner.clone(), hook("peer discovery"));
        }
        if !inner.config.disable_stream_discovery {
            discovery::spawn_stream_discovery(inner.clone(), hook("stream discovery"));
            discovery::spawn_ring_refresh(inner.clone(), hook("ring refresh"));
        }
        if !inner.config.disable_broadcast {
            broadcast::spawn_broadcast(inner.clone(), hook("broadcast"));
        }
        if !inner.config.disable_analytics {
            analytics::spawn_analytics(inner.clone(), hook("analytics"));
        }
        if !inner.config.disable_nat_port_map {
            if let Some(mapper) = self.port_mapper {
                nat::spawn_nat_monitor(inner.clone(), mapper, hook("NAT monitor"));
            }
        }

        Ok(Client {
            inner,
            hooks: Mutex::new(hooks),
        })
    }
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            port_mapper: None,
        }
    }

    /// Create and bootstrap a client.
    pub async fn new(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// The multiaddr forms of every known self-address.
    pub fn addresses(&self) -> Vec<String> {
        self.inner
            .peerstore
            .addrs(&self.inner.peer_id)
            .iter()
            .map(messages::to_multiaddr)
            .collect()
    }

    /// Number of peers in the routing table.
    pub fn peer_count(&self) -> usize {
        self.inner.table.size()
    }

    /// Number of live artifact streams, both directions.
    pub fn stream_count(&self) -> usize {
        self.inner.streams.inbound_size() + self.inner.streams.outbound_size()
    }

    /// Smoothed round-trip latency observed for a peer.
    pub fn latency(&self, peer: &PeerId) -> Option<Duration> {
        self.inner.peerstore.latency(peer)
    }

    /// Record contact info for a peer.
    pub fn add_address(&self, peer: PeerId, addr: SocketAddr, ttl: AddressTtl) {
        self.inner.peerstore.add_addrs(peer, &[addr], ttl);
    }

    /// Enqueue an artifact for broadcast. Blocks while the send queue is
    /// full.
    pub async fn send(&self, artifact: Artifact) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.inner
            .send_tx
            .send(artifact)
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Receive the next artifact delivered by the overlay. Returns `None`
    /// once the client has shut down and in-flight deliveries drained.
    pub async fn receive(&self) -> Option<Artifact> {
        self.inner.receive_rx.lock().await.recv().await
    }

    /// Probe a peer's reachability and record its latency.
    pub async fn ping(&self, peer: PeerId) -> Result<()> {
        ping::ping(&self.inner, peer).await
    }

    /// Ask a peer for a random sample of its routing table.
    pub async fn sample(&self, peer: PeerId) -> Result<Vec<crate::messages::PeerInfo>> {
        sample::sample(&self.inner, peer).await
    }

    /// Request a long-lived artifact-exchange stream with a peer.
    pub async fn pair(&self, peer: PeerId) -> Result<bool> {
        pair::pair(&self.inner, peer).await
    }

    /// Run the mutual authentication handshake with a peer.
    pub async fn authenticate(&self, peer: PeerId) -> Result<bool> {
        auth::authenticate(&self.inner, peer).await
    }

    /// Register the commitment callback of the authentication carrier.
    pub fn set_commitment_handler<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<u8>> + Send + 'static,
    {
        self.inner.auth_handlers.write().unwrap().commitment =
            Arc::new(move || Box::pin(handler()));
    }

    /// Register the challenge callback of the authentication carrier.
    pub fn set_challenge_handler<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<u8>> + Send + 'static,
    {
        self.inner.auth_handlers.write().unwrap().challenge =
            Arc::new(move || Box::pin(handler()));
    }

    /// Register the proof callback of the authentication carrier.
    pub fn set_proof_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<u8>> + Send + 'static,
    {
        self.inner.auth_handlers.write().unwrap().proof =
            Arc::new(move |commitment, challenge| Box::pin(handler(commitment, challenge)));
    }

    /// Register the verification callback of the authentication carrier.
    pub fn set_verification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Vec<u8>, Vec<u8>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.inner.auth_handlers.write().unwrap().verification =
            Arc::new(move |commitment, challenge, proof| {
                Box::pin(handler(commitment, challenge, proof))
            });
    }

    /// Stop the maintenance loops in reverse start order, close every
    /// stream, and shut the endpoint down.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let hooks: Vec<ShutdownHook> = self.hooks.lock().unwrap().drain(..).collect();
        for (name, tx) in hooks.into_iter().rev() {
            debug!(task = name, "stopping");
            let _ = tx.send(());
        }
        self.inner.streams.purge();
        self.inner.transport.close().await;
        // Process loops hold clones; once they exit, the receive channel
        // drains to a clean close.
        self.inner.receive_tx.lock().unwrap().take();
    }
}

/// Ping each seed node with bounded retries; survivors become permanent
/// contacts and routing-table entries.
async fn greet_seed_nodes(inner: &Arc<Inner>) {
    let mut greetings = Vec::new();
    for seed in &inner.config.seed_nodes {
        let (addr, id) = match messages::parse_multiaddr(seed) {
            Ok((addr, Some(id))) => (addr, id),
            _ => continue, // validated at construction
        };
        if id == inner.peer_id {
            continue;
        }
        let inner = inner.clone();
        let seed = seed.clone();
        greetings.push(tokio::spawn(async move {
            for attempt in 0..SEED_GREETING_ATTEMPTS {
                inner.peerstore.add_addrs(id, &[addr], AddressTtl::Temp);
                match ping::ping(&inner, id).await {
                    Ok(()) => {
                        inner
                            .peerstore
                            .set_addrs(id, &[addr], AddressTtl::Permanent);
                        inner.table.add(id);
                        return;
                    }
                    Err(e) => {
                        debug!(seed = %seed, attempt, error = %e, "seed greeting failed");
                        tokio::time::sleep(SEED_GREETING_BACKOFF).await;
                    }
                }
            }
            warn!(seed = %seed, "{}", Error::SeedUnreachable(seed.clone()));
        }));
    }
    for greeting in greetings {
        let _ = greeting.await;
    }
}
