//! Client configuration and validation.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::messages;

/// Configuration for an overlay client. [`Config::default`] carries
/// values suitable for a production deployment; every knob is bounds-
/// checked by [`Config::validate`] before a client starts.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often an analytics report is posted.
    pub analytics_interval: Duration,
    /// Endpoint the analytics reports are posted to.
    pub analytics_url: String,
    /// Opaque embedder data echoed in every report.
    pub analytics_user_data: String,
    /// Bound on the duplicate-suppression cache.
    pub artifact_cache_size: usize,
    /// Broadcast chunk length in bytes.
    pub artifact_chunk_size: u32,
    /// Largest artifact body accepted from a peer.
    pub artifact_max_buffer_size: u32,
    /// Depth of the application send and receive queues.
    pub artifact_queue_size: usize,
    /// Largest authentication challenge accepted from a peer.
    pub challenge_max_buffer_size: u32,
    /// Cluster identifier echoed in analytics reports.
    pub cluster_id: i64,
    pub disable_analytics: bool,
    pub disable_broadcast: bool,
    pub disable_nat_port_map: bool,
    pub disable_peer_discovery: bool,
    pub disable_stream_discovery: bool,
    /// Address to listen on.
    pub ip: String,
    /// Routing-table bucket size.
    pub k_bucket_size: usize,
    /// Latency-ring refresh period.
    pub latency_tolerance: Duration,
    /// Polling interval of the NAT monitor.
    pub nat_monitor_interval: Duration,
    /// How long the NAT monitor waits for a port-mapping device.
    pub nat_monitor_timeout: Duration,
    /// Network name; part of the protocol prefix, so clients on
    /// different networks cannot pair.
    pub network: String,
    /// Ping payload length in bytes.
    pub ping_buffer_size: u32,
    /// Port to listen on; zero picks an ephemeral port.
    pub port: u16,
    /// Process identifier echoed in analytics reports.
    pub process_id: i64,
    /// Largest authentication commitment or proof accepted from a peer.
    pub proof_max_buffer_size: u32,
    /// Hex-encoded 32-byte seed for a deterministic identity; empty
    /// means a random identity.
    pub random_seed: String,
    /// Largest peer-sample frame accepted from a peer.
    pub sample_max_buffer_size: u32,
    /// Number of peers returned by the sample service.
    pub sample_size: usize,
    /// Bootstrap nodes, `/ip4/<ip>/udp/<port>/quic-v1/p2p/<base58>`.
    pub seed_nodes: Vec<String>,
    /// Bound on the authentication cool-off cache.
    pub spammer_cache_size: usize,
    /// Artifact stream fan-in.
    pub streamstore_inbound_capacity: usize,
    /// Artifact stream fan-out.
    pub streamstore_outbound_capacity: usize,
    /// Depth of each stream's writer queue.
    pub streamstore_queue_size: usize,
    /// Per-operation deadline for service reads and writes.
    pub timeout: Duration,
    /// Protocol version; part of the protocol prefix.
    pub version: String,
    /// Bound on the witness cache.
    pub witness_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            analytics_interval: Duration::from_secs(60),
            analytics_url: "https://analytics.revolver.zone/report".to_string(),
            analytics_user_data: String::new(),
            artifact_cache_size: 65_536,
            artifact_chunk_size: 65_536,
            artifact_max_buffer_size: 16 * 1024 * 1024,
            artifact_queue_size: 8_192,
            challenge_max_buffer_size: 32,
            cluster_id: 0,
            disable_analytics: false,
            disable_broadcast: false,
            disable_nat_port_map: false,
            disable_peer_discovery: false,
            disable_stream_discovery: false,
            ip: "0.0.0.0".to_string(),
            k_bucket_size: 16,
            latency_tolerance: Duration::from_secs(60),
            nat_monitor_interval: Duration::from_secs(1),
            nat_monitor_timeout: Duration::from_secs(60),
            network: "revolver".to_string(),
            ping_buffer_size: 32,
            port: 0,
            process_id: 0,
            proof_max_buffer_size: 8_192,
            random_seed: String::new(),
            sample_max_buffer_size: 8_192,
            sample_size: 4,
            seed_nodes: Vec::new(),
            spammer_cache_size: 16_384,
            streamstore_inbound_capacity: 16,
            streamstore_outbound_capacity: 48,
            streamstore_queue_size: 8_192,
            timeout: Duration::from_secs(10),
            version: "0.1.0".to_string(),
            witness_cache_size: 65_536,
        }
    }
}

/// A configuration knob failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {value}")]
pub struct ConfigError {
    pub field: &'static str,
    pub value: String,
}

fn invalid(field: &'static str, value: impl ToString) -> ConfigError {
    ConfigError {
        field,
        value: value.to_string(),
    }
}

impl Config {
    /// Check every knob, naming the first offender.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analytics_interval.is_zero() {
            return Err(invalid("analytics interval", "0"));
        }
        if self.artifact_cache_size == 0 {
            return Err(invalid("artifact cache size", 0));
        }
        if self.artifact_chunk_size == 0 {
            return Err(invalid("artifact chunk size", 0));
        }
        if self.artifact_max_buffer_size == 0 {
            return Err(invalid("artifact max buffer size", 0));
        }
        if self.artifact_queue_size == 0 {
            return Err(invalid("artifact queue size", 0));
        }
        if self.challenge_max_buffer_size == 0 {
            return Err(invalid("challenge max buffer size", 0));
        }
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(invalid("IP address", &self.ip));
        }
        if self.k_bucket_size == 0 {
            return Err(invalid("Kademlia bucket size", 0));
        }
        if self.latency_tolerance.is_zero() {
            return Err(invalid("latency tolerance", "0"));
        }
        if self.nat_monitor_interval.is_zero() {
            return Err(invalid("NAT monitor interval", "0"));
        }
        if self.nat_monitor_timeout.is_zero() {
            return Err(invalid("NAT monitor timeout", "0"));
        }
        if self.network.is_empty() {
            return Err(invalid("network", "<empty>"));
        }
        if self.ping_buffer_size == 0 {
            return Err(invalid("ping buffer size", 0));
        }
        if self.proof_max_buffer_size == 0 {
            return Err(invalid("proof max buffer size", 0));
        }
        if !self.random_seed.is_empty() {
            let decoded = hex::decode(&self.random_seed);
            match decoded {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => return Err(invalid("random seed", &self.random_seed)),
            }
        }
        if self.sample_max_buffer_size == 0 {
            return Err(invalid("peer sample max buffer size", 0));
        }
        if self.sample_size == 0 {
            return Err(invalid("peer sample size", 0));
        }
        for seed in &self.seed_nodes {
            match messages::parse_multiaddr(seed) {
                Ok((_, Some(_))) => {}
                _ => return Err(invalid("seed node", seed)),
            }
        }
        if self.spammer_cache_size == 0 {
            return Err(invalid("spammer cache size", 0));
        }
        if self.streamstore_inbound_capacity == 0 {
            return Err(invalid("stream store inbound capacity", 0));
        }
        if self.streamstore_outbound_capacity == 0 {
            return Err(invalid("stream store outbound capacity", 0));
        }
        if self.streamstore_queue_size == 0 {
            return Err(invalid("stream store transaction queue size", 0));
        }
        if self.timeout.is_zero() {
            return Err(invalid("stream timeout", "0"));
        }
        if self.version.is_empty() {
            return Err(invalid("version", "<empty>"));
        }
        if self.witness_cache_size == 0 {
            return Err(invalid("witness cache size", 0));
        }
        Ok(())
    }

    /// The protocol prefix shared by every service on this network.
    pub fn protocol_prefix(&self) -> String {
        format!("/{}/{}", self.network, self.version)
    }

    /// Decode the random seed, or `None` when a random identity was
    /// requested. Call after [`validate`](Self::validate).
    pub(crate) fn seed_bytes(&self) -> Option<[u8; 32]> {
        if self.random_seed.is_empty() {
            return None;
        }
        let bytes = hex::decode(&self.random_seed).ok()?;
        bytes.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_knobs() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("artifact chunk size", Box::new(|c| c.artifact_chunk_size = 0)),
            ("artifact queue size", Box::new(|c| c.artifact_queue_size = 0)),
            ("Kademlia bucket size", Box::new(|c| c.k_bucket_size = 0)),
            ("ping buffer size", Box::new(|c| c.ping_buffer_size = 0)),
            ("stream timeout", Box::new(|c| c.timeout = Duration::ZERO)),
            (
                "stream store inbound capacity",
                Box::new(|c| c.streamstore_inbound_capacity = 0),
            ),
        ];
        for (field, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert_eq!(err.field, field);
        }
    }

    #[test]
    fn rejects_bad_ip() {
        let mut config = Config::default();
        config.ip = "999.0.0.1".to_string();
        assert_eq!(config.validate().unwrap_err().field, "IP address");
    }

    #[test]
    fn rejects_bad_random_seed() {
        let mut config = Config::default();
        config.random_seed = "abcd".to_string();
        assert_eq!(config.validate().unwrap_err().field, "random seed");

        config.random_seed = "zz".repeat(32);
        assert!(config.validate().is_err());

        config.random_seed = "ab".repeat(32);
        config.validate().unwrap();
        assert!(config.seed_bytes().is_some());
    }

    #[test]
    fn rejects_seed_node_without_identity() {
        let mut config = Config::default();
        config.seed_nodes = vec!["/ip4/127.0.0.1/udp/4433/quic-v1".to_string()];
        assert_eq!(config.validate().unwrap_err().field, "seed node");

        let id = Keypair::generate().peer_id();
        config.seed_nodes = vec![format!("/ip4/127.0.0.1/udp/4433/quic-v1/p2p/{}", id)];
        config.validate().unwrap();
    }

    #[test]
    fn protocol_prefix_carries_network_and_version() {
        let config = Config::default();
        assert_eq!(config.protocol_prefix(), "/revolver/0.1.0");
    }
}
