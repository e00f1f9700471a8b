//! Crate-wide error taxonomy.
//!
//! Every per-stream failure is handled at the stream's owning task: the
//! stream is closed, dropped from the store, and the overlay carries on.
//! Only construction ([`crate::Client::new`]) and bootstrap surface errors
//! to the caller.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    /// The configuration failed validation. Fatal at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listen address is already taken. Fatal at bootstrap.
    #[error("address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// A seed node could not be greeted. Logged; bootstrap continues.
    #[error("seed node unreachable: {0}")]
    SeedUnreachable(String),

    /// No route to the peer: no known addresses, or every dial failed.
    #[error("peer unreachable")]
    PeerUnreachable,

    /// The stream was closed or reset by either side.
    #[error("stream closed")]
    StreamClosed,

    /// A read or write exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The peer sent bytes that violate the protocol framing.
    #[error("corrupt data")]
    CorruptData,

    /// The recomputed SHA-256 of an artifact payload does not match its
    /// metadata checksum.
    #[error("artifact checksum mismatch")]
    ChecksumMismatch,

    /// A length prefix exceeds the configured acceptance cap.
    #[error("buffer of {size} bytes exceeds limit of {max}")]
    BufferTooLarge { size: u64, max: u64 },

    /// A writer actor's transaction queue is full.
    #[error("transaction queue is full")]
    QueueFull,

    /// The client is shutting down.
    #[error("client is shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
