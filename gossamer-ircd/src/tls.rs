//! TLS material and rustls configurations.
//!
//! One CA pool roots all trust: server links must present a certificate it
//! signed, client listeners verify a certificate if one is offered, and
//! outbound links present our own certificate and verify the peer's.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// CA bundle plus this server's certificate chain and key. Read-only after
/// load.
pub struct TlsMaterial {
    roots: Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl TlsMaterial {
    pub fn load(ca: &Path, cert: &Path, key: &Path) -> Result<Self> {
        let ca_pem = std::fs::read(ca)
            .with_context(|| format!("Failed to read TLS CA bundle: {}", ca.display()))?;
        let cert_pem = std::fs::read(cert)
            .with_context(|| format!("Failed to read TLS certificate: {}", cert.display()))?;
        let key_pem = std::fs::read(key)
            .with_context(|| format!("Failed to read TLS private key: {}", key.display()))?;
        Self::from_pem(&ca_pem, &cert_pem, &key_pem)
    }

    pub fn from_pem(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for ca in rustls_pemfile::certs(&mut &ca_pem[..]) {
            let ca = ca.context("Failed to parse TLS CA bundle")?;
            roots.add(ca).context("Invalid TLS CA certificate")?;
        }
        if roots.is_empty() {
            anyhow::bail!("TLS CA bundle contains no certificates");
        }
        tracing::debug!(count = roots.len(), "Loaded TLS CA certificates");

        let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse TLS certificates")?;
        if certs.is_empty() {
            anyhow::bail!("No certificate found in PEM file");
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Failed to parse TLS private key")?
            .context("No private key found in PEM file")?;

        Ok(Self {
            roots: Arc::new(roots),
            certs,
            key,
            provider: Arc::new(ring::default_provider()),
        })
    }

    fn server_config(&self, client_cert_required: bool) -> Result<rustls::ServerConfig> {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(self.roots.clone(), self.provider.clone());
        let verifier = if client_cert_required {
            verifier.build()
        } else {
            verifier.allow_unauthenticated().build()
        }
        .context("Failed to build client certificate verifier")?;

        rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .context("Unsupported TLS protocol versions")?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("Invalid TLS configuration")
    }

    /// Acceptor for server links: a verified client certificate is mandatory.
    pub fn link_acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config(true)?)))
    }

    /// Acceptor for TLS client listeners: a client certificate is verified
    /// if one is given.
    pub fn client_acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config(false)?)))
    }

    /// Connector for outbound links, presenting our certificate.
    pub fn connector(&self) -> Result<TlsConnector> {
        let config = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .context("Unsupported TLS protocol versions")?
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .context("Invalid TLS client configuration")?;
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Server name to verify the peer's certificate against when dialing.
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).with_context(|| format!("Invalid server name: {name}"))
}

/// Common name of the first certificate in a peer chain.
pub fn peer_common_name(chain: Option<&[CertificateDer<'_>]>) -> Option<String> {
    let leaf = chain?.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}
