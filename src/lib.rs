//! # Rumor - Peer-to-Peer Gossip Overlay
//!
//! Rumor lets a process join a structured overlay network and disseminate
//! opaque binary **artifacts** (checksummed, optionally gzip-compressed,
//! timestamped blobs) to every other participant with low duplication
//! and bounded fan-out.
//!
//! - **Identity**: Ed25519-based peer IDs (32-byte public keys), printed
//!   in base58
//! - **Transport**: QUIC with mutual TLS bound to the peer identity
//! - **Routing**: Kademlia-style XOR buckets augmented by latency rings
//! - **Dissemination**: chunked broadcast with witness tracking and LRU
//!   duplicate suppression
//!
//! ## Architecture
//!
//! Long-lived subsystems are tasks communicating over bounded channels.
//! Each outbound artifact stream has a dedicated single-writer actor;
//! each inbound stream has a dedicated process loop. Broadcast fan-out
//! dispatches synchronously and awaits completions through per-peer
//! result channels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `client` | High-level handle combining all components |
//! | `artifact` | Artifact values and the 45-byte metadata framing |
//! | `streamstore` | Per-peer stream registry with writer actors |
//! | `routing` | XOR buckets, latency rings, neighbour selection |
//! | `ping`, `sample`, `pair`, `auth` | Per-stream services |
//! | `broadcast`, `process` | Producer and consumer pipelines |
//! | `discovery` | Peer and stream discovery loops |
//! | `nat` | External address monitoring |
//! | `analytics` | Periodic status reports |
//! | `transport`, `crypto` | Authenticated QUIC stream multiplexer |
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = rumor::Config::default();
//! config.ip = "127.0.0.1".to_string();
//! config.seed_nodes = vec![seed_multiaddr];
//!
//! let client = rumor::Client::new(config).await?;
//! client.send(rumor::Artifact::from_bytes(b"hello overlay", true)?).await?;
//! if let Some(artifact) = client.receive().await {
//!     let payload = artifact.to_bytes().await?;
//! }
//! ```

mod analytics;
mod artifact;
mod auth;
mod broadcast;
mod client;
pub mod codec;
mod config;
mod crypto;
mod discovery;
mod error;
mod identity;
mod messages;
mod nat;
mod pair;
mod peerstore;
mod ping;
mod process;
mod routing;
mod sample;
mod streamstore;
mod transport;

pub use analytics::Report;
pub use artifact::{decode_metadata, encode_metadata, Artifact, CloseSignal, METADATA_LEN};
pub use client::{Client, ClientBuilder};
pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use identity::{Keypair, ParsePeerIdError, PeerId};
pub use messages::{parse_multiaddr, to_multiaddr, to_multiaddr_with_peer, PeerInfo};
pub use nat::{PortMapper, PortMapping};
pub use peerstore::AddressTtl;
pub use routing::BucketView;
pub use streamstore::Direction;
