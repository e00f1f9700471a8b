//! End-to-end artifact dissemination between real clients.
//!
//! Exercises the broadcast and process pipelines over loopback QUIC:
//! ordered delivery on a single pair, and duplicate suppression around a
//! four-node ring with active forwarders.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, RngCore};
use rumor::{parse_multiaddr, AddressTtl, Artifact, Client, Config};
use tokio::time::timeout;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.ip = "127.0.0.1".to_string();
    config.disable_analytics = true;
    config.disable_nat_port_map = true;
    config.disable_peer_discovery = true;
    config.disable_stream_discovery = true;
    config
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn new_client() -> Client {
    init_tracing();
    Client::new(quiet_config()).await.expect("client must start")
}

fn socket_addr(client: &Client) -> SocketAddr {
    let addrs = client.addresses();
    let (addr, _) = parse_multiaddr(&addrs[0]).expect("own address is well-formed");
    addr
}

/// Teach `a` how to reach `b` and validate the route; the ping also
/// registers each side in the other's routing table.
async fn introduce(a: &Client, b: &Client) {
    a.add_address(b.peer_id(), socket_addr(b), AddressTtl::Provider);
    a.ping(b.peer_id()).await.expect("ping must succeed");
}

async fn pair(a: &Client, b: &Client) {
    introduce(a, b).await;
    let accepted = a.pair(b.peer_id()).await.expect("pair handshake");
    assert!(accepted, "pair request must be accepted");
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_delivers_artifacts_in_order() {
    let a = new_client().await;
    let b = new_client().await;
    pair(&a, &b).await;

    let mut rng = rand::thread_rng();
    let mut payloads = Vec::new();
    for _ in 0..10 {
        let mut data = vec![0u8; rng.gen_range(1..=300_000)];
        rng.fill_bytes(&mut data);
        payloads.push(data);
    }

    for data in &payloads {
        let compress = rng.gen_bool(0.5);
        let artifact = Artifact::from_bytes(data, compress).expect("artifact from payload");
        a.send(artifact).await.expect("send must succeed");
    }

    for (i, expected) in payloads.iter().enumerate() {
        let artifact = timeout(RECEIVE_TIMEOUT, b.receive())
            .await
            .expect("artifact must arrive in time")
            .expect("receive channel open");
        let data = artifact.to_bytes().await.expect("artifact must verify");
        assert_eq!(&data, expected, "artifact {i} corrupted or out of order");
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ring_topology_never_delivers_duplicates() {
    const ARTIFACTS: usize = 1_000;

    // A ring A–B–C–D–A, paired in both directions on every edge.
    let a = Arc::new(new_client().await);
    let b = Arc::new(new_client().await);
    let c = Arc::new(new_client().await);
    let d = Arc::new(new_client().await);

    for (x, y) in [(&a, &b), (&b, &c), (&c, &d), (&d, &a)] {
        pair(x, y).await;
        pair(y, x).await;
    }

    // B and D forward whatever they receive back onto the ring.
    for forwarder in [b.clone(), d.clone()] {
        tokio::spawn(async move {
            while let Some(artifact) = forwarder.receive().await {
                let data = artifact.to_bytes().await.expect("forwarded artifact verifies");
                let copy = Artifact::from_bytes(&data, false).expect("re-wrap artifact");
                if forwarder.send(copy).await.is_err() {
                    break;
                }
            }
        });
    }

    for i in 0..ARTIFACTS {
        let payload = format!("artifact-{i:04}");
        let artifact = Artifact::from_bytes(payload.as_bytes(), false).expect("artifact");
        a.send(artifact).await.expect("send must succeed");
    }

    // C must see every artifact exactly once, regardless of fan-in.
    let mut seen = HashSet::new();
    for _ in 0..ARTIFACTS {
        let artifact = timeout(RECEIVE_TIMEOUT, c.receive())
            .await
            .expect("artifact must arrive in time")
            .expect("receive channel open");
        let data = artifact.to_bytes().await.expect("artifact must verify");
        assert!(seen.insert(data), "duplicate artifact delivered");
    }
    assert_eq!(seen.len(), ARTIFACTS);

    // And nothing else trickles in afterwards.
    assert!(
        timeout(Duration::from_millis(500), c.receive()).await.is_err(),
        "late duplicate delivered"
    );

    for client in [a, b, c, d] {
        client.shutdown().await;
    }
}
