//! Secure transport multiplexer.
//!
//! Opens authenticated bidirectional byte streams between peer IDs over a
//! single QUIC endpoint. The TLS layer (see [`crate::crypto`]) binds each
//! connection to the remote's Ed25519 identity, so every stream arrives
//! with a verified [`PeerId`].
//!
//! Streams are multiplexed by protocol id: the dialer opens a stream and
//! writes a length-prefixed id (`/<network>/<version>/<service>`); the
//! accept loop reads it and dispatches to the registered handler.
//!
//! Connections are cached behind an actor that owns the LRU and the
//! dialing state; handles are cheap to clone and talk to it over a
//! command channel.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec;
use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId};

/// Longest accepted protocol id frame.
const MAX_PROTOCOL_ID_LEN: u32 = 256;

/// Maximum number of cached connections. Long-lived artifact streams
/// keep their connection pinned through the per-connection accept task,
/// so eviction here only drops idle dialer handles.
const MAX_CACHED_CONNECTIONS: usize = 1_024;

/// Command channel capacity for the connection actor.
const CONN_COMMAND_CHANNEL_SIZE: usize = 256;

/// A registered per-stream service handler. The socket address is the
/// remote's observed endpoint; peers dial from their listening socket,
/// so it doubles as their contact address.
pub type StreamHandler = Arc<
    dyn Fn(PeerId, SocketAddr, SendStream, RecvStream) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

enum ConnCommand {
    GetOrConnect {
        peer: PeerId,
        addrs: Vec<SocketAddr>,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Invalidate {
        peer: PeerId,
    },
    Quit,
}

/// Owns the connection cache; dials at most one peer at a time, which
/// also serialises concurrent dials to the same peer.
struct ConnActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    dial_timeout: Duration,
    connections: LruCache<PeerId, Connection>,
}

impl ConnActor {
    fn new(endpoint: Endpoint, client_config: ClientConfig, dial_timeout: Duration) -> Self {
        Self {
            endpoint,
            client_config,
            dial_timeout,
            connections: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("cache bound is non-zero"),
            ),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ConnCommand::GetOrConnect { peer, addrs, reply } => {
                    let result = self.get_or_connect(peer, &addrs).await;
                    let _ = reply.send(result);
                }
                ConnCommand::Invalidate { peer } => {
                    if self.connections.pop(&peer).is_some() {
                        debug!(peer = %peer, "invalidated cached connection");
                    }
                }
                ConnCommand::Quit => break,
            }
        }
    }

    async fn get_or_connect(&mut self, peer: PeerId, addrs: &[SocketAddr]) -> Result<Connection> {
        if let Some(conn) = self.connections.get(&peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            self.connections.pop(&peer);
        }

        let sni = crypto::sni_for(&peer);
        for addr in addrs {
            let connecting = match self
                .endpoint
                .connect_with(self.client_config.clone(), *addr, &sni)
            {
                Ok(c) => c,
                Err(e) => {
                    debug!(peer = %peer, addr = %addr, error = %e, "cannot initiate connection");
                    continue;
                }
            };
            match tokio::time::timeout(self.dial_timeout, connecting).await {
                Ok(Ok(conn)) => {
                    self.connections.put(peer, conn.clone());
                    return Ok(conn);
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer, addr = %addr, error = %e, "cannot establish connection");
                }
                Err(_) => {
                    debug!(peer = %peer, addr = %addr, "connection attempt timed out");
                }
            }
        }
        Err(Error::PeerUnreachable)
    }
}

/// A QUIC endpoint plus the service dispatch table.
pub struct Transport {
    endpoint: Endpoint,
    timeout: Duration,
    cmd_tx: mpsc::Sender<ConnCommand>,
    handlers: Arc<RwLock<HashMap<String, StreamHandler>>>,
}

impl Transport {
    /// Bind the endpoint and spawn the connection actor. The ALPN value
    /// is the network name.
    pub fn new(
        keypair: &Keypair,
        bind: SocketAddr,
        network: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let (cert, key) = crypto::self_signed_identity(keypair).map_err(into_io)?;
        let server_config =
            crypto::server_config(cert.clone(), key.clone_key(), network.as_bytes())
                .map_err(into_io)?;
        let client_config = crypto::client_config(cert, key, network.as_bytes()).map_err(into_io)?;

        let endpoint = Endpoint::server(server_config, bind).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::AddressInUse(bind)
            } else {
                Error::Io(e)
            }
        })?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CONN_COMMAND_CHANNEL_SIZE);
        tokio::spawn(ConnActor::new(endpoint.clone(), client_config, timeout).run(cmd_rx));

        Ok(Self {
            endpoint,
            timeout,
            cmd_tx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Register the handler invoked for every accepted stream that opens
    /// with this protocol id.
    pub fn set_stream_handler(&self, protocol: impl Into<String>, handler: StreamHandler) {
        self.handlers
            .write()
            .unwrap()
            .insert(protocol.into(), handler);
    }

    /// Start accepting connections; one task per connection, one task per
    /// stream.
    pub fn start_accept(&self) {
        let endpoint = self.endpoint.clone();
        let handlers = self.handlers.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(incoming, handlers, timeout).await {
                        debug!(error = %e, "connection error");
                    }
                });
            }
        });
    }

    /// Open an authenticated stream to `peer` for `protocol`, trying the
    /// given addresses in order.
    pub async fn dial(
        &self,
        peer: PeerId,
        addrs: &[SocketAddr],
        protocol: &str,
    ) -> Result<(SendStream, RecvStream)> {
        if addrs.is_empty() {
            return Err(Error::PeerUnreachable);
        }
        let conn = self.get_or_connect(peer, addrs.to_vec()).await?;
        let (mut send, recv) = match conn.open_bi().await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(peer = %peer, error = %e, "cannot open stream");
                self.invalidate(peer).await;
                return Err(Error::PeerUnreachable);
            }
        };
        codec::write_frame(&mut send, protocol.as_bytes(), self.timeout).await?;
        Ok((send, recv))
    }

    /// Stop the actor and close the endpoint; every stream on every
    /// connection dies with it. Dropping the handlers also releases the
    /// client state they capture.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ConnCommand::Quit).await;
        self.handlers.write().unwrap().clear();
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    async fn get_or_connect(&self, peer: PeerId, addrs: Vec<SocketAddr>) -> Result<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCommand::GetOrConnect {
                peer,
                addrs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        reply_rx.await.map_err(|_| Error::Shutdown)?
    }

    async fn invalidate(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(ConnCommand::Invalidate { peer }).await;
    }
}

fn into_io(e: anyhow::Error) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

async fn handle_connection(
    incoming: Incoming,
    handlers: Arc<RwLock<HashMap<String, StreamHandler>>>,
    timeout: Duration,
) -> Result<()> {
    let connection = incoming.await.map_err(|_| Error::PeerUnreachable)?;
    let remote = connection.remote_address();

    let Some(peer) = crypto::connection_peer(&connection) else {
        warn!(remote = %remote, "rejecting connection: unverifiable peer identity");
        return Err(Error::CorruptData);
    };
    debug!(peer = %peer, remote = %remote, "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed)
            | Err(quinn::ConnectionError::TimedOut) => {
                debug!(peer = %peer, "connection closed");
                return Ok(());
            }
            Err(_) => return Err(Error::StreamClosed),
        };

        let handlers = handlers.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(peer, remote, stream, handlers, timeout).await {
                debug!(peer = %peer, error = %e, "stream error");
            }
        });
    }
}

async fn handle_stream(
    peer: PeerId,
    remote: SocketAddr,
    (send, mut recv): (SendStream, RecvStream),
    handlers: Arc<RwLock<HashMap<String, StreamHandler>>>,
    timeout: Duration,
) -> Result<()> {
    let raw = codec::read_frame(&mut recv, MAX_PROTOCOL_ID_LEN, timeout).await?;
    let protocol = String::from_utf8(raw).map_err(|_| Error::CorruptData)?;

    let handler = handlers.read().unwrap().get(&protocol).cloned();
    match handler {
        Some(handler) => {
            handler(peer, remote, send, recv).await;
            Ok(())
        }
        None => {
            debug!(peer = %peer, protocol = %protocol, "no handler for protocol");
            Err(Error::CorruptData)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn new_transport(network: &str) -> (Transport, PeerId, SocketAddr) {
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();
        let transport = Transport::new(
            &keypair,
            "127.0.0.1:0".parse().unwrap(),
            network,
            Duration::from_secs(5),
        )
        .unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, peer, addr)
    }

    #[tokio::test]
    async fn dial_dispatches_to_the_registered_handler() {
        let (a, _a_id, _a_addr) = new_transport("testnet");
        let (b, b_id, b_addr) = new_transport("testnet");

        b.set_stream_handler(
            "/testnet/0.1.0/echo",
            Arc::new(|_peer, _remote, mut send, mut recv| {
                Box::pin(async move {
                    let mut buf = [0u8; 5];
                    recv.read_exact(&mut buf).await.unwrap();
                    send.write_all(&buf).await.unwrap();
                })
            }),
        );
        b.start_accept();

        let (mut send, mut recv) = a
            .dial(b_id, &[b_addr], "/testnet/0.1.0/echo")
            .await
            .unwrap();
        send.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn mismatched_network_cannot_connect() {
        let (a, _, _) = new_transport("net-one");
        let (b, b_id, b_addr) = new_transport("net-two");
        b.start_accept();

        let err = a
            .dial(b_id, &[b_addr], "/net-one/0.1.0/ping")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn dialing_a_wrong_identity_fails() {
        let (a, _, _) = new_transport("testnet");
        let (b, _b_id, b_addr) = new_transport("testnet");
        b.start_accept();

        // The certificate b presents will not match this identity.
        let imposter = Keypair::generate().peer_id();
        let err = a
            .dial(imposter, &[b_addr], "/testnet/0.1.0/ping")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn dial_without_addresses_is_unreachable() {
        let (a, _, _) = new_transport("testnet");
        let peer = Keypair::generate().peer_id();
        let err = a.dial(peer, &[], "/testnet/0.1.0/ping").await.unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable));
        a.close().await;
    }
}
