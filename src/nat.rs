//! NAT monitor: tracking externally mapped addresses.
//!
//! The transport's port-mapping capability is consumed through the
//! [`PortMapper`] trait. Once the device reports ready (bounded by the
//! configured timeout), the monitor polls the internal→external address
//! map and publishes any new external address for the listened socket as
//! a permanent self-address.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::client::Inner;
use crate::messages;
use crate::peerstore::AddressTtl;

/// One port mapping reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub internal: SocketAddr,
    pub external: SocketAddr,
}

/// A port-mapping device (UPnP, NAT-PMP, or a test double).
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Resolves once the device is usable.
    async fn ready(&self);

    /// The current internal→external mappings.
    async fn mappings(&self) -> Vec<PortMapping>;
}

/// Spawn the NAT monitor.
pub(crate) fn spawn_nat_monitor(
    inner: Arc<Inner>,
    mapper: Arc<dyn PortMapper>,
    mut quit: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        if tokio::time::timeout(inner.config.nat_monitor_timeout, mapper.ready())
            .await
            .is_err()
        {
            warn!("failed to locate NAT device");
            return;
        }

        let listen = inner.listen_addr;
        let mut current = listen;
        loop {
            tokio::select! {
                _ = &mut quit => break,
                _ = tokio::time::sleep(inner.config.nat_monitor_interval) => {
                    for mapping in mapper.mappings().await {
                        if mapping.internal == listen && mapping.external != current {
                            info!(
                                "I am {}",
                                messages::to_multiaddr_with_peer(&mapping.external, &inner.peer_id)
                            );
                            inner.peerstore.add_addrs(
                                inner.peer_id,
                                &[mapping.external],
                                AddressTtl::Permanent,
                            );
                            current = mapping.external;
                        }
                    }
                }
            }
        }
    });
}
