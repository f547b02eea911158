//! Node certificate handling.
//!
//! Certificates live in a cache directory that external ACME tooling renews
//! in place; when the directory is empty a self-signed pair is generated so
//! the node can come up before the first issuance. The controller pins the
//! chain by hash, so self-signed material is fully usable for Juicity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use base64::Engine as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::juicity::cert_chain_hash;

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

pub struct CertifiedIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertifiedIdentity {
    /// Load the PEM pair from `dir`, generating a self-signed one for
    /// `hostname` when the directory holds none.
    pub fn load_or_generate(dir: &Path, hostname: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create certificate directory {}", dir.display()))?;
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if !cert_path.exists() || !key_path.exists() {
            info!(%hostname, dir = %dir.display(), "no certificate found, generating a self-signed one");
            let generated = rcgen::generate_simple_self_signed(vec![hostname.to_owned()])
                .context("generate self-signed certificate")?;
            std::fs::write(&cert_path, generated.cert.pem()).context("write certificate")?;
            std::fs::write(&key_path, generated.key_pair.serialize_pem()).context("write private key")?;
        }
        Self::load(&cert_path, &key_path)
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::File::open(cert_path)
            .with_context(|| format!("open {}", cert_path.display()))?;
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
            .collect::<Result<_, _>>()
            .context("parse certificate chain")?;
        anyhow::ensure!(!chain.is_empty(), "certificate file holds no certificate");

        let key_pem = std::fs::File::open(key_path).with_context(|| format!("open {}", key_path.display()))?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
            .context("parse private key")?
            .context("key file holds no private key")?;

        Ok(CertifiedIdentity { chain, key })
    }

    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// The hash the controller pins: base64url of SHA-256 over the DER
    /// chain.
    pub fn chain_hash_base64(&self) -> String {
        let hash = cert_chain_hash(self.chain.iter().map(|c| c.as_ref()));
        base64::engine::general_purpose::URL_SAFE.encode(hash)
    }

    /// TLS acceptor for the gRPC transport (h2 over TLS).
    pub fn h2_acceptor(&self) -> anyhow::Result<TlsAcceptor> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain(), self.key())
            .context("build tls config")?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

pub fn cert_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("certificates")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = CertifiedIdentity::load_or_generate(dir.path(), "node.example.org").expect("generate");
        let hash = first.chain_hash_base64();
        assert!(!hash.is_empty());

        // A second load must reuse the same material, not regenerate.
        let second = CertifiedIdentity::load_or_generate(dir.path(), "node.example.org").expect("reload");
        assert_eq!(second.chain_hash_base64(), hash);
    }

    #[test]
    fn acceptor_builds_from_generated_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = CertifiedIdentity::load_or_generate(dir.path(), "node.example.org").expect("generate");
        assert!(identity.h2_acceptor().is_ok());
    }
}
