//! TLS identity binding for the transport.
//!
//! Every node self-signs a certificate from its Ed25519 keypair, so the
//! 32-byte subject key of a certificate IS the peer identity and no CA
//! is involved. A dialer puts the identity it wants to reach into the
//! SNI; the server's certificate must carry that exact key, and the
//! server in turn demands a well-formed Ed25519 client certificate. The
//! ALPN value carries the network name, so clients of different networks
//! cannot finish a handshake.
//!
//! Certificate verification is custom (the rustls `dangerous()` entry
//! point): trust is key equality, not a chain. The per-version
//! `verify_tls12_signature`/`verify_tls13_signature` methods and the
//! scheme list are rustls-imposed plumbing and delegate to the provider.

use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, PeerId};

/// Crypto provider for rustls, backed by ring.
static PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Build the node's self-signed identity certificate. The subject key is
/// the Ed25519 identity key, the SAN is the same DNS form of the
/// identity that dialers put in the SNI, and the CN is the printable
/// peer id.
pub fn self_signed_identity(
    keypair: &Keypair,
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let peer = keypair.peer_id();
    let pkcs8 = keypair
        .to_pkcs8_der()
        .context("cannot encode the identity key as PKCS#8")?;
    let pkcs8_key = PrivatePkcs8KeyDer::from(pkcs8);

    let signer = rcgen::KeyPair::try_from(&pkcs8_key)
        .context("identity key cannot sign certificates")?;
    let mut params = rcgen::CertificateParams::new(vec![sni_for(&peer)])
        .context("cannot build certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(peer.to_base58()),
    );
    let cert = params
        .self_signed(&signer)
        .context("cannot self-sign the identity certificate")?;

    Ok((cert.der().clone(), PrivateKeyDer::from(pkcs8_key)))
}

/// Server-side QUIC config: demands an Ed25519 client certificate and
/// only ever speaks TLS 1.3.
pub fn server_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    alpn: &[u8],
) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 is unavailable")?
        .with_client_cert_verifier(Arc::new(IdentityVerifier))
        .with_single_cert(vec![cert], key)
        .context("cannot assemble the server TLS config")?;
    tls.alpn_protocols = vec![alpn.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls)
            .context("cannot derive the QUIC server config")?,
    ));
    config.transport_config(transport_tuning());
    Ok(config)
}

/// Client-side QUIC config: presents our certificate and checks the
/// server's key against the identity in the SNI.
pub fn client_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    alpn: &[u8],
) -> Result<ClientConfig> {
    let mut tls = rustls::ClientConfig::builder_with_provider(PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 is unavailable")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(IdentityVerifier))
        .with_client_auth_cert(vec![cert], key)
        .context("cannot assemble the client TLS config")?;
    tls.alpn_protocols = vec![alpn.to_vec()];

    let mut config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .context("cannot derive the QUIC client config")?,
    ));
    config.transport_config(transport_tuning());
    Ok(config)
}

/// Keep quiet but live connections open (artifact streams can idle
/// between broadcasts) while still detecting dead peers.
fn transport_tuning() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .expect("60 seconds is a valid idle timeout"),
    ));
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(15)));
    Arc::new(transport)
}

/// The authenticated identity of a connection's remote, read back out of
/// the certificate chain rustls verified during the handshake.
pub fn connection_peer(connection: &quinn::Connection) -> Option<PeerId> {
    let certs = connection.peer_identity()?;
    let chain: &Vec<CertificateDer> = certs.downcast_ref()?;
    identity_from_cert(chain.first()?)
}

/// The peer identity a certificate asserts: its subject key, accepted
/// only when the SPKI algorithm is Ed25519.
fn identity_from_cert(cert: &CertificateDer<'_>) -> Option<PeerId> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let spki = parsed.public_key();
    if spki.algorithm.algorithm != x509_parser::oid_registry::OID_SIG_ED25519 {
        return None;
    }
    let raw: [u8; 32] = spki.subject_public_key.data.as_ref().try_into().ok()?;
    Some(PeerId::from_bytes(raw))
}

/// DNS labels are capped at 63 octets, so the 64 hex characters of an
/// identity travel as two labels.
pub(crate) fn sni_for(peer: &PeerId) -> String {
    let hex = hex::encode(peer.as_bytes());
    let (hi, lo) = hex.split_at(32);
    format!("{hi}.{lo}")
}

fn peer_id_for_sni(name: &str) -> Option<PeerId> {
    let joined: String = name.split('.').collect();
    let mut raw = [0u8; 32];
    hex::decode_to_slice(joined.as_bytes(), &mut raw).ok()?;
    Some(PeerId::from_bytes(raw))
}

fn bad_cert(kind: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(kind)
}

fn ed25519_schemes() -> Vec<rustls::SignatureScheme> {
    vec![rustls::SignatureScheme::ED25519]
}

fn handshake_signature(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
    tls13: bool,
) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    let algorithms = &PROVIDER.signature_verification_algorithms;
    if tls13 {
        rustls::crypto::verify_tls13_signature(message, cert, dss, algorithms)
    } else {
        rustls::crypto::verify_tls12_signature(message, cert, dss, algorithms)
    }
}

/// Both halves of certificate verification. As a client verifier it
/// admits any well-formed Ed25519 identity (who connected is read back
/// per stream); as a server verifier it additionally requires the
/// certificate key to match the identity the dialer asked for.
#[derive(Debug)]
struct IdentityVerifier;

impl rustls::server::danger::ClientCertVerifier for IdentityVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let peer =
            identity_from_cert(end_entity).ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;
        if !peer.is_valid() {
            return Err(bad_cert(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        handshake_signature(message, cert, dss, false)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        handshake_signature(message, cert, dss, true)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        ed25519_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl rustls::client::danger::ServerCertVerifier for IdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let expected = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => peer_id_for_sni(name.as_ref()),
            _ => None,
        }
        .ok_or(bad_cert(rustls::CertificateError::NotValidForName))?;

        match identity_from_cert(end_entity) {
            Some(actual) if actual == expected => {
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }
            Some(_) => Err(bad_cert(rustls::CertificateError::NotValidForName)),
            None => Err(bad_cert(rustls::CertificateError::BadEncoding)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        handshake_signature(message, cert, dss, false)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        handshake_signature(message, cert, dss, true)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        ed25519_schemes()
    }
}
