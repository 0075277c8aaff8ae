//! QUIC endpoint setup and stream framing.
//!
//! Each node runs a single Quinn endpoint configured for both roles. TLS is
//! transport encryption only: certificates are freshly self-signed at
//! startup and clients accept any server certificate. Node identity is
//! established by the signed hello exchanged on every new connection (see
//! [`crate::bus`]), which binds the peer's Ed25519 key to the connection's
//! exported keying material.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::wire::MAX_FRAME_SIZE;
use crate::{Result, TransportError};

/// ALPN protocol identifier.
pub const ALPN_HAVEN: &[u8] = b"haven/1";

/// Idle timeout before an unused connection is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// A QUIC node able to both accept and initiate connections.
pub struct QuicNode {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicNode {
    /// Bind an endpoint on `bind_addr` with a fresh self-signed certificate.
    pub fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let server_config = build_server_config()?;
        let client_config = build_client_config()?;

        let mut endpoint = Endpoint::server(server_config, bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(%local_addr, "peer bus listening");

        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming connection attempt.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Dial a remote peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection> {
        let connecting = self
            .endpoint
            .connect(addr, "haven-node")
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        connecting
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// Close the endpoint and all connections.
    pub fn close(&self) {
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    }
}

/// Write one length-prefixed frame (`[len:4 LE][data]`).
pub async fn write_frame(stream: &mut SendStream, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| TransportError::InvalidFrame("frame too large for prefix".into()))?;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed frame, bounding the allocation.
pub async fn read_frame(stream: &mut RecvStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::InvalidFrame(format!(
            "frame of {len} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(buf)
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;
    let params = rcgen::CertificateParams::new(vec!["haven-node".to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-sign failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

fn build_server_config() -> Result<ServerConfig> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server cert config failed: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_HAVEN.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

fn build_client_config() -> Result<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN_HAVEN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto failed: {e}")))?,
    )))
}

/// Accepts any server certificate: TLS is used only for transport
/// encryption here, and node identity is proven by the signed hello after
/// the handshake.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_value() {
        assert_eq!(ALPN_HAVEN, b"haven/1");
    }

    #[test]
    fn test_self_signed_cert_generation() {
        let (cert, key) = generate_self_signed_cert().expect("generate");
        assert!(!cert.is_empty());
        match key {
            PrivateKeyDer::Pkcs8(k) => assert!(!k.secret_pkcs8_der().is_empty()),
            _ => unreachable!("expected PKCS8 key"),
        }
    }

    #[test]
    fn test_configs_build() {
        assert!(build_server_config().is_ok());
        assert!(build_client_config().is_ok());
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let node = QuicNode::bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
        assert_ne!(node.local_addr().port(), 0);
        node.close();
    }
}
