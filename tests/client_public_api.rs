//! Public-surface scenarios: construction, ping, sampling,
//! authentication, and analytics reporting between real clients.

use std::net::SocketAddr;
use std::time::Duration;

use rumor::{parse_multiaddr, AddressTtl, Client, Config, Error, Report};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

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

async fn introduce(a: &Client, b: &Client) {
    a.add_address(b.peer_id(), socket_addr(b), AddressTtl::Provider);
    a.ping(b.peer_id()).await.expect("ping must succeed");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_is_rejected_at_construction() {
    let mut config = quiet_config();
    config.artifact_queue_size = 0;
    match Client::new(config).await {
        Err(Error::Config(e)) => assert_eq!(e.field, "artifact queue size"),
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn taken_port_fails_with_address_in_use() {
    let a = new_client().await;
    let mut config = quiet_config();
    config.port = socket_addr(&a).port();
    match Client::new(config).await {
        Err(Error::AddressInUse(_)) => {}
        other => panic!("expected AddressInUse, got {other:?}"),
    }
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_records_positive_latency() {
    let a = new_client().await;
    let b = new_client().await;

    a.add_address(b.peer_id(), socket_addr(&b), AddressTtl::Provider);
    a.ping(b.peer_id()).await.expect("ping must succeed");

    let latency = a.latency(&b.peer_id()).expect("latency recorded");
    assert!(latency > Duration::ZERO);

    // The responder learned about the caller too.
    assert_eq!(b.peer_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_failure_forgets_the_peer() {
    let mut config = quiet_config();
    config.timeout = Duration::from_secs(1);
    let a = Client::new(config).await.expect("client must start");
    let ghost = rumor::Keypair::generate().peer_id();
    a.add_address(ghost, "127.0.0.1:1".parse().unwrap(), AddressTtl::Provider);

    assert!(a.ping(ghost).await.is_err());
    assert_eq!(a.peer_count(), 0);

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sample_returns_transitive_peers() {
    let a = new_client().await;
    let b = new_client().await;
    let c = new_client().await;

    // B knows C; A knows B.
    introduce(&b, &c).await;
    introduce(&a, &b).await;

    let sample = a.sample(b.peer_id()).await.expect("sample must succeed");
    assert!(
        sample.iter().any(|info| info.id == c.peer_id()),
        "sample from B must contain C"
    );
    for info in &sample {
        assert!(!info.socket_addrs().is_empty(), "sampled peer has addresses");
    }

    for client in [a, b, c] {
        client.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_authentication_round_trip() {
    let a = new_client().await;
    let b = new_client().await;

    for client in [&a, &b] {
        client.set_commitment_handler(|| async { b"commitment".to_vec() });
        client.set_challenge_handler(|| async { b"challenge".to_vec() });
        client.set_proof_handler(|commitment, challenge| async move {
            [commitment, challenge].concat()
        });
        client.set_verification_handler(|commitment, challenge, proof| async move {
            proof == [commitment, challenge].concat()
        });
    }

    introduce(&a, &b).await;
    let accepted = a.authenticate(b.peer_id()).await.expect("auth handshake");
    assert!(accepted, "both sides run honest handlers");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_proof_fails_verification() {
    let a = new_client().await;
    let b = new_client().await;

    // A rejects whatever B proves; B accepts anything.
    a.set_verification_handler(|_, _, _| async { false });

    introduce(&a, &b).await;
    let accepted = a.authenticate(b.peer_id()).await.expect("auth handshake");
    assert!(!accepted);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeat_authentication_is_stalled_by_the_spammer_cache() {
    let mut config = quiet_config();
    config.timeout = Duration::from_secs(2);
    let a = Client::new(config.clone()).await.expect("client must start");
    let b = Client::new(config).await.expect("client must start");

    introduce(&a, &b).await;
    let accepted = a.authenticate(b.peer_id()).await.expect("first handshake");
    assert!(accepted);

    // Inside the cool-off window the responder stalls and hangs up.
    assert!(a.authenticate(b.peer_id()).await.is_err());

    a.shutdown().await;
    b.shutdown().await;
}

/// Minimal HTTP sink: accepts POSTs, decodes the JSON body as a
/// [`Report`], and forwards it to the test.
async fn spawn_report_sink() -> (String, tokio::sync::mpsc::Receiver<Report>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind report sink");
    let url = format!("http://{}/report", listener.local_addr().unwrap());
    let (report_tx, report_rx) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let report_tx = report_tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);

                while buf.len() < header_end + content_length {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                }

                if let Ok(report) =
                    serde_json::from_slice::<Report>(&buf[header_end..header_end + content_length])
                {
                    let _ = report_tx.send(report).await;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            });
        }
    });

    (url, report_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn analytics_report_reflects_the_paired_peer() {
    let (url, mut reports) = spawn_report_sink().await;

    let mut config = quiet_config();
    config.disable_analytics = false;
    config.analytics_url = url;
    config.analytics_interval = Duration::from_millis(200);
    config.cluster_id = 7;
    config.analytics_user_data = "test-run".to_string();

    let a = Client::new(config).await.expect("client must start");
    let b = new_client().await;

    introduce(&a, &b).await;
    assert!(a.pair(b.peer_id()).await.expect("pair handshake"));

    let deadline = Duration::from_secs(10);
    let found = timeout(deadline, async {
        while let Some(report) = reports.recv().await {
            if report.node_id == a.peer_id().to_base58()
                && report.streams.contains(&b.peer_id().to_base58())
            {
                assert_eq!(report.network, "revolver");
                assert_eq!(report.cluster_id, 7);
                assert_eq!(report.user_data, "test-run");
                assert!(report.peers >= 1);
                assert!(!report.addrs.is_empty());
                return true;
            }
        }
        false
    })
    .await
    .expect("a matching report must arrive in time");
    assert!(found);

    a.shutdown().await;
    b.shutdown().await;
}
