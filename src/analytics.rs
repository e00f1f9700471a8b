//! Analytics reporting.
//!
//! A periodic JSON POST of the client's status to the configured
//! endpoint. The receiving server keys reports by `NodeID` and stamps
//! its own receipt time. Failures are logged and never fatal.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::client::Inner;

/// The report wire schema, shared with the topology inspector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    #[serde(rename = "Addrs")]
    pub addrs: Vec<String>,
    #[serde(rename = "ClusterID")]
    pub cluster_id: i64,
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "Peers")]
    pub peers: usize,
    #[serde(rename = "ProcessID")]
    pub process_id: i64,
    #[serde(rename = "Streams")]
    pub streams: Vec<String>,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "UserData")]
    pub user_data: String,
    #[serde(rename = "Version")]
    pub version: String,
}

fn build_report(inner: &Inner) -> Report {
    let mut streams: Vec<String> = inner
        .streams
        .outbound_peers()
        .into_iter()
        .chain(inner.streams.inbound_peers())
        .map(|p| p.to_base58())
        .collect();
    streams.sort();
    streams.dedup();

    Report {
        addrs: inner
            .peerstore
            .addrs(&inner.peer_id)
            .iter()
            .map(crate::messages::to_multiaddr)
            .collect(),
        cluster_id: inner.config.cluster_id,
        network: inner.config.network.clone(),
        node_id: inner.peer_id.to_base58(),
        peers: inner.table.size(),
        process_id: inner.config.process_id,
        streams,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
        user_data: inner.config.analytics_user_data.clone(),
        version: inner.config.version.clone(),
    }
}

/// Spawn the analytics loop: report immediately, then every interval.
pub(crate) fn spawn_analytics(inner: Arc<Inner>, mut quit: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        loop {
            let report = build_report(&inner);
            match http
                .post(&inner.config.analytics_url)
                .json(&report)
                .send()
                .await
            {
                Ok(response) => debug!(status = %response.status(), "posted analytics report"),
                Err(e) => warn!(error = %e, "cannot send analytics report"),
            }

            tokio::select! {
                _ = &mut quit => break,
                _ = tokio::time::sleep(inner.config.analytics_interval) => {}
            }
        }
    });
}
