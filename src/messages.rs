//! Wire types and address formats.
//!
//! Peer samples travel as length-prefixed JSON arrays of [`PeerInfo`];
//! addresses are printed in multiaddr form
//! (`/ip4/<ip>/udp/<port>/quic-v1[/p2p/<base58-id>]`) so a sample entry
//! is self-describing and a seed-node string carries both the dial
//! address and the expected identity.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// A peer's identity and dial addresses, as exchanged by the sample
/// service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    #[serde(rename = "ID")]
    pub id: PeerId,
    #[serde(rename = "Addrs")]
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self {
            id,
            addrs: addrs.iter().map(to_multiaddr).collect(),
        }
    }

    /// The dialable socket addresses this entry carries, dropping any
    /// malformed strings.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addrs
            .iter()
            .filter_map(|a| parse_multiaddr(a).ok().map(|(addr, _)| addr))
            .collect()
    }
}

/// Render a socket address in multiaddr form.
pub fn to_multiaddr(addr: &SocketAddr) -> String {
    let family = match addr.ip() {
        IpAddr::V4(_) => "ip4",
        IpAddr::V6(_) => "ip6",
    };
    format!("/{}/{}/udp/{}/quic-v1", family, addr.ip(), addr.port())
}

/// Render a socket address plus peer identity, the form seed nodes are
/// configured in.
pub fn to_multiaddr_with_peer(addr: &SocketAddr, id: &PeerId) -> String {
    format!("{}/p2p/{}", to_multiaddr(addr), id)
}

/// Parse a multiaddr string. The `/p2p/<base58>` suffix is optional;
/// anything else malformed is [`Error::CorruptData`].
pub fn parse_multiaddr(s: &str) -> Result<(SocketAddr, Option<PeerId>)> {
    let mut parts = s.split('/');
    if parts.next() != Some("") {
        return Err(Error::CorruptData);
    }

    let ip: IpAddr = match (parts.next(), parts.next()) {
        (Some("ip4"), Some(host)) | (Some("ip6"), Some(host)) => {
            host.parse().map_err(|_| Error::CorruptData)?
        }
        _ => return Err(Error::CorruptData),
    };

    let port: u16 = match (parts.next(), parts.next()) {
        (Some("udp"), Some(port)) => port.parse().map_err(|_| Error::CorruptData)?,
        _ => return Err(Error::CorruptData),
    };

    if parts.next() != Some("quic-v1") {
        return Err(Error::CorruptData);
    }

    let id = match (parts.next(), parts.next()) {
        (None, _) => None,
        (Some("p2p"), Some(b58)) => Some(b58.parse().map_err(|_| Error::CorruptData)?),
        _ => return Err(Error::CorruptData),
    };

    if parts.next().is_some() {
        return Err(Error::CorruptData);
    }

    Ok((SocketAddr::new(ip, port), id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn multiaddr_round_trip() {
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let rendered = to_multiaddr(&addr);
        assert_eq!(rendered, "/ip4/127.0.0.1/udp/4433/quic-v1");
        let (parsed, id) = parse_multiaddr(&rendered).unwrap();
        assert_eq!(parsed, addr);
        assert!(id.is_none());
    }

    #[test]
    fn multiaddr_with_peer_round_trip() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let peer = Keypair::generate().peer_id();
        let rendered = to_multiaddr_with_peer(&addr, &peer);
        let (parsed, id) = parse_multiaddr(&rendered).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(id, Some(peer));
    }

    #[test]
    fn multiaddr_rejects_garbage() {
        for bad in [
            "",
            "127.0.0.1:4433",
            "/tcp/4433",
            "/ip4/127.0.0.1/tcp/4433",
            "/ip4/nonsense/udp/4433/quic-v1",
            "/ip4/127.0.0.1/udp/4433/quic-v1/p2p/!!!",
            "/ip4/127.0.0.1/udp/4433/quic-v1/extra",
        ] {
            assert!(parse_multiaddr(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn peer_info_json_shape() {
        let peer = Keypair::generate().peer_id();
        let info = PeerInfo::new(peer, vec!["10.0.0.1:4433".parse().unwrap()]);
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"ID\""));
        assert!(json.contains("\"Addrs\""));
        let back: PeerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.socket_addrs(), vec!["10.0.0.1:4433".parse().unwrap()]);
    }
}
