//! Juicity outbound leg with a pinned upstream certificate chain.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;
use uuid::Uuid;

use crate::dialer::{BoxedStream, Dialer, Outbound};
use crate::metadata::Metadata;

use super::proto::{Authenticate, STREAM_CMD_CONNECT, StreamHeader};
use super::server::exporter_token;

/// Disguise SNI carried on the QUIC handshake.
const SNI: &str = "software.download.prss.microsoft.com";

/// SHA-256 over the concatenated DER certificates, in presentation order.
pub fn cert_chain_hash(chain: impl IntoIterator<Item = impl AsRef<[u8]>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for cert in chain {
        hasher.update(cert.as_ref());
    }
    hasher.finalize().into()
}

#[derive(Debug)]
struct PinnedChainVerifier {
    pinned: [u8; 32],
}

impl ServerCertVerifier for PinnedChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain = std::iter::once(end_entity.as_ref()).chain(intermediates.iter().map(|c| c.as_ref()));
        if cert_chain_hash(chain) == self.pinned {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("pinned hash of cert chain does not match".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub struct JuicityOutbound {
    host: String,
    port: u16,
    uuid: Uuid,
    password: String,
    pinned: [u8; 32],
    dialer: Dialer,
    congestion: String,
    // Established QUIC connection, reused across dials.
    state: tokio::sync::Mutex<Option<(quinn::Endpoint, quinn::Connection)>>,
}

impl JuicityOutbound {
    pub fn new(
        host: String,
        port: u16,
        username: &str,
        password: &str,
        pinned_base64: &str,
        dialer: Dialer,
    ) -> anyhow::Result<Self> {
        let uuid: Uuid = username
            .parse()
            .map_err(|_| anyhow::anyhow!("juicity outbound username is not a uuid"))?;
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(pinned_base64)
            .context("decode pinned_certchain_sha256")?;
        let pinned: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("pinned_certchain_sha256 must be 32 bytes"))?;
        Ok(JuicityOutbound {
            host,
            port,
            uuid,
            password: password.to_owned(),
            pinned,
            dialer,
            congestion: "bbr".to_owned(),
            state: tokio::sync::Mutex::new(None),
        })
    }

    fn client_config(&self) -> anyhow::Result<quinn::ClientConfig> {
        let mut crypto = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedChainVerifier { pinned: self.pinned }))
            .with_no_client_auth();
        crypto.alpn_protocols = vec![b"h3".to_vec()];

        let mut config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto).context("quic tls")?));
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(std::time::Duration::from_secs(10)));
        super::apply_congestion(&mut transport, &self.congestion);
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    async fn connection(&self) -> anyhow::Result<quinn::Connection> {
        let mut state = self.state.lock().await;
        if let Some((_, connection)) = state.as_ref() {
            if connection.close_reason().is_none() {
                return Ok(connection.clone());
            }
        }

        let remote: SocketAddr = {
            let port = self.port;
            self.dialer.resolve_udp(&self.host, port).await?
        };
        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal")
        } else {
            "[::]:0".parse().expect("literal")
        };
        let endpoint = quinn::Endpoint::client(bind).context("bind quic client endpoint")?;
        let connection = endpoint
            .connect_with(self.client_config()?, remote, SNI)
            .context("quic connect")?
            .await
            .context("quic handshake")?;

        // Authenticate on a fresh unidirectional stream.
        let token = exporter_token(&connection, &self.uuid, &self.password)?;
        let mut auth_stream = connection.open_uni().await.context("open auth stream")?;
        let auth = Authenticate {
            uuid: self.uuid,
            token,
        };
        auth_stream.write_all(&auth.encode()).await?;
        auth_stream.finish()?;

        *state = Some((endpoint, connection.clone()));
        Ok(connection)
    }
}

#[async_trait]
impl Outbound for JuicityOutbound {
    async fn dial(&self, target: &Metadata) -> anyhow::Result<BoxedStream> {
        let connection = self.connection().await?;
        let (send, recv) = connection.open_bi().await.context("open stream")?;
        let mut stream = tokio::io::join(recv, send);
        let header = StreamHeader {
            cmd: STREAM_CMD_CONNECT,
            target: target.clone(),
        };
        stream.write_all(&header.encode()).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_hash_is_order_sensitive() {
        let a = cert_chain_hash([b"cert-a".as_ref(), b"cert-b".as_ref()]);
        let b = cert_chain_hash([b"cert-b".as_ref(), b"cert-a".as_ref()]);
        assert_ne!(a, b);
        assert_eq!(a, cert_chain_hash([b"cert-a".as_ref(), b"cert-b".as_ref()]));
    }

    #[test]
    fn outbound_requires_valid_pin() {
        let dialer = Dialer::new(false);
        let pin = base64::engine::general_purpose::URL_SAFE.encode([0u8; 32]);
        assert!(
            JuicityOutbound::new(
                "relay.example.org".to_owned(),
                443,
                "6f3d1a3e-0f4d-4f6e-9e8b-0a1b2c3d4e5f",
                "secret",
                &pin,
                dialer.clone(),
            )
            .is_ok()
        );
        assert!(
            JuicityOutbound::new(
                "relay.example.org".to_owned(),
                443,
                "6f3d1a3e-0f4d-4f6e-9e8b-0a1b2c3d4e5f",
                "secret",
                "too-short",
                dialer,
            )
            .is_err()
        );
    }
}
