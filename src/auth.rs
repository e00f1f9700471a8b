//! Auth service: a four-slot sigma-protocol carrier.
//!
//! The core carries commitment / challenge / proof / verification
//! messages between peers but prescribes no cryptography: the embedder
//! registers four async callbacks, and the defaults are no-op accepts.
//! Both sides run the prover and verifier halves in sequence: the
//! responder verifies first, then proves.
//!
//! A bounded spammer cache rate-limits repeat verification attempts per
//! peer to one per ten minutes; offenders get a stalled, then closed,
//! stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::client::Inner;
use crate::codec;
use crate::error::Result;
use crate::identity::PeerId;
use crate::transport::StreamHandler;

const SERVICE: &str = "auth";

/// Cool-off between verification attempts from the same peer.
const SPAM_COOLOFF: Duration = Duration::from_secs(10 * 60);

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Emits this node's commitment.
pub type CommitmentHandler = Arc<dyn Fn() -> BoxFuture<Vec<u8>> + Send + Sync>;

/// Emits a challenge for a remote prover.
pub type ChallengeHandler = Arc<dyn Fn() -> BoxFuture<Vec<u8>> + Send + Sync>;

/// Emits a proof for `(own commitment, remote challenge)`.
pub type ProofHandler = Arc<dyn Fn(Vec<u8>, Vec<u8>) -> BoxFuture<Vec<u8>> + Send + Sync>;

/// Verifies `(commitment, challenge, proof)` from a remote prover.
pub type VerificationHandler =
    Arc<dyn Fn(Vec<u8>, Vec<u8>, Vec<u8>) -> BoxFuture<bool> + Send + Sync>;

/// The registered callback slots.
pub(crate) struct AuthHandlers {
    pub(crate) commitment: CommitmentHandler,
    pub(crate) challenge: ChallengeHandler,
    pub(crate) proof: ProofHandler,
    pub(crate) verification: VerificationHandler,
}

impl Default for AuthHandlers {
    fn default() -> Self {
        Self {
            commitment: Arc::new(|| Box::pin(async { Vec::new() })),
            challenge: Arc::new(|| Box::pin(async { Vec::new() })),
            proof: Arc::new(|_, _| Box::pin(async { Vec::new() })),
            verification: Arc::new(|_, _, _| Box::pin(async { true })),
        }
    }
}

struct Slots {
    commitment: CommitmentHandler,
    challenge: ChallengeHandler,
    proof: ProofHandler,
    verification: VerificationHandler,
}

fn slots(inner: &Inner) -> Slots {
    let handlers = inner.auth_handlers.read().unwrap();
    Slots {
        commitment: handlers.commitment.clone(),
        challenge: handlers.challenge.clone(),
        proof: handlers.proof.clone(),
        verification: handlers.verification.clone(),
    }
}

/// Run the mutual authentication handshake with a peer: prove our
/// eligibility, then verify theirs.
pub(crate) async fn authenticate(inner: &Arc<Inner>, peer: PeerId) -> Result<bool> {
    debug!(peer = %peer, "proving eligibility");

    let addrs = inner.peerstore.addrs(&peer);
    let (mut send, mut recv) = match inner
        .transport
        .dial(peer, &addrs, &inner.protocol(SERVICE))
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            debug!(peer = %peer, error = %e, "cannot reach peer for authentication");
            inner.drop_peer(&peer);
            return Err(e);
        }
    };

    let handlers = slots(inner);
    let deadline = inner.config.timeout;
    let challenge_max = inner.config.challenge_max_buffer_size;
    let proof_max = inner.config.proof_max_buffer_size;

    // Prover half.
    let commitment = (handlers.commitment)().await;
    codec::write_frame(&mut send, &commitment, deadline).await?;
    let challenge = codec::read_frame(&mut recv, challenge_max, deadline).await?;
    let proof = (handlers.proof)(commitment, challenge).await;
    codec::write_frame(&mut send, &proof, deadline).await?;

    debug!(peer = %peer, "verifying eligibility");

    // Verifier half.
    let their_commitment = codec::read_frame(&mut recv, proof_max, deadline).await?;
    let our_challenge = (handlers.challenge)().await;
    codec::write_frame(&mut send, &our_challenge, deadline).await?;
    let their_proof = codec::read_frame(&mut recv, proof_max, deadline).await?;

    let success = (handlers.verification)(their_commitment, our_challenge, their_proof).await;
    Ok(success)
}

/// Whether the peer attempted verification inside the cool-off window.
/// Records the attempt either way.
fn is_spamming(cache: &Mutex<LruCache<PeerId, Instant>>, peer: PeerId, cooloff: Duration) -> bool {
    let mut cache = cache.lock().unwrap();
    let spamming = matches!(cache.get(&peer), Some(last) if last.elapsed() < cooloff);
    cache.put(peer, Instant::now());
    spamming
}

/// Register the authentication handler.
pub(crate) fn register(inner: &Arc<Inner>) {
    let handler: StreamHandler = {
        let inner = inner.clone();
        Arc::new(move |peer, _remote, mut send, mut recv| {
            let inner = inner.clone();
            Box::pin(async move {
                debug!(peer = %peer, "verifying eligibility");

                if is_spamming(&inner.spammer_cache, peer, SPAM_COOLOFF) {
                    debug!(peer = %peer, "stalling repeat verification attempt");
                    tokio::time::sleep(inner.config.timeout).await;
                    return;
                }

                let handlers = slots(&inner);
                let deadline = inner.config.timeout;
                let challenge_max = inner.config.challenge_max_buffer_size;
                let proof_max = inner.config.proof_max_buffer_size;

                let outcome: Result<()> = async {
                    // Verifier half.
                    let their_commitment =
                        codec::read_frame(&mut recv, proof_max, deadline).await?;
                    let challenge = (handlers.challenge)().await;
                    codec::write_frame(&mut send, &challenge, deadline).await?;
                    let their_proof = codec::read_frame(&mut recv, proof_max, deadline).await?;

                    if !(handlers.verification)(their_commitment, challenge, their_proof).await {
                        debug!(peer = %peer, "verification failed");
                        return Ok(());
                    }

                    debug!(peer = %peer, "proving eligibility");

                    // Prover half.
                    let commitment = (handlers.commitment)().await;
                    codec::write_frame(&mut send, &commitment, deadline).await?;
                    let their_challenge =
                        codec::read_frame(&mut recv, challenge_max, deadline).await?;
                    let proof = (handlers.proof)(commitment, their_challenge).await;
                    codec::write_frame(&mut send, &proof, deadline).await?;
                    Ok(())
                }
                .await;

                if let Err(e) = outcome {
                    debug!(peer = %peer, error = %e, "authentication handshake failed");
                }
            })
        })
    };
    inner
        .transport
        .set_stream_handler(inner.protocol(SERVICE), handler);
}
