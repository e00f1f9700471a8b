//! Peer identity and the XOR keyspace.
//!
//! A peer is identified by the 32 raw bytes of its Ed25519 public key.
//! Identifiers are totally ordered by their bytes and printed in base58.
//! Routing distance is measured in the XOR metric over SHA-256 of the
//! identifier, which spreads peers uniformly across the keyspace
//! regardless of how their keys were generated.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// An Ed25519 signing keypair. The public half is the peer's identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the system CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Derive a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// PKCS#8 encoding of the signing key, as TLS backends consume it.
    pub(crate) fn to_pkcs8_der(&self) -> Result<Vec<u8>, ed25519_dalek::pkcs8::Error> {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        Ok(self.signing_key.to_pkcs8_der()?.as_bytes().to_vec())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.public_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// A 32-byte peer identifier derived from an Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Printable base58 form.
    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Position of this peer in the routing keyspace.
    pub fn routing_key(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }

    /// Whether the identifier is a valid Ed25519 public key point.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b58 = self.to_base58();
        write!(f, "PeerId({}…)", &b58[..8.min(b58.len())])
    }
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| ParsePeerIdError)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ParsePeerIdError)?;
        Ok(Self(arr))
    }
}

/// The string was not a base58 encoding of 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsePeerIdError;

impl fmt::Display for ParsePeerIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid base58 peer identifier")
    }
}

impl std::error::Error for ParsePeerIdError {}

// Peer identifiers travel in JSON (peer samples, analytics reports) as
// base58 strings.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR of two keyspace positions.
#[inline]
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as 256-bit big-endian magnitudes.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

/// Index of the distance class `other` falls into relative to `self_key`:
/// the number of leading zero bits of their XOR. Identical keys map to
/// the last bucket.
pub fn bucket_index(self_key: &[u8; 32], other: &[u8; 32]) -> usize {
    let dist = xor_distance(self_key, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_base58_round_trip() {
        for _ in 0..20 {
            let id = Keypair::generate().peer_id();
            let parsed: PeerId = id.to_base58().parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn peer_id_rejects_malformed_base58() {
        assert!("3yZe7d".parse::<PeerId>().is_err());
        assert!("not/base58".parse::<PeerId>().is_err());
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let seed = [7u8; 32];
        let a = Keypair::from_seed(&seed);
        let b = Keypair::from_seed(&seed);
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = Keypair::generate().peer_id().routing_key();
        let b = Keypair::generate().peer_id().routing_key();
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn bucket_index_counts_leading_zero_bits() {
        let zero = [0u8; 32];
        let mut other = [0u8; 32];
        other[0] = 0x80;
        assert_eq!(bucket_index(&zero, &other), 0);
        other[0] = 0x01;
        assert_eq!(bucket_index(&zero, &other), 7);
        other[0] = 0x00;
        other[1] = 0x40;
        assert_eq!(bucket_index(&zero, &other), 9);
        assert_eq!(bucket_index(&zero, &zero), 255);
    }

    #[test]
    fn peer_id_serializes_as_base58_json() {
        let id = Keypair::generate().peer_id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_base58()));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
