//! TLS configuration and certificate loading.
//!
//! Builds the rustls server configuration (protocol set, client
//! certificate verifier) and the matching `CertificatePolicy`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::auth::certificate::{CertificatePolicy, TlsVersion, TrustChainCheck, WebPkiChainCheck};
use crate::config::{ClientAuthMode, TlsConfig};

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("unsupported protocol version {0:?}")]
    UnsupportedProtocol(String),

    #[error("client certificate verification requires tls.client_ca_path")]
    MissingClientCa,

    #[error("client verifier: {0}")]
    Verifier(String),

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Everything the listener needs to terminate TLS.
#[derive(Clone)]
pub struct TlsSetup {
    pub acceptor: TlsAcceptor,
    pub policy: CertificatePolicy,
}

impl std::fmt::Debug for TlsSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSetup").field("policy", &self.policy).finish_non_exhaustive()
    }
}

/// Rejects every chain; used when client certificates are not requested.
struct NoClientCertificates;

impl TrustChainCheck for NoClientCertificates {
    fn verify(&self, _chain: &[CertificateDer<'static>]) -> Result<(), String> {
        Err("client certificates are not accepted".to_string())
    }
}

/// Load certificates, key and CA bundle and build the acceptor and policy.
pub fn build_tls(config: &TlsConfig) -> Result<TlsSetup, TlsSetupError> {
    let versions = config
        .protocols
        .iter()
        .map(|p| TlsVersion::parse(p).ok_or_else(|| TlsSetupError::UnsupportedProtocol(p.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    let rustls_versions: Vec<_> = versions.iter().map(|v| v.to_rustls()).collect();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = load_certs(Path::new(&config.cert_path))?;
    let key = load_private_key(Path::new(&config.key_path))?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&rustls_versions)?;

    let (server_config, trust): (ServerConfig, Arc<dyn TrustChainCheck>) =
        if config.client_auth.requests_certificate() {
            let ca_path = config
                .client_ca_path
                .as_deref()
                .ok_or(TlsSetupError::MissingClientCa)?;
            let verifier = client_verifier(Path::new(ca_path), config.client_auth, provider)?;
            let server_config = builder
                .with_client_cert_verifier(verifier.clone())
                .with_single_cert(certs, key)?;
            (server_config, Arc::new(WebPkiChainCheck::new(verifier)))
        } else {
            let server_config = builder.with_no_client_auth().with_single_cert(certs, key)?;
            (server_config, Arc::new(NoClientCertificates))
        };

    tracing::info!(
        component = "tls",
        protocols = ?versions,
        client_auth = ?config.client_auth,
        "TLS configured"
    );

    Ok(TlsSetup {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        policy: CertificatePolicy {
            allowed_versions: versions,
            client_auth: config.client_auth,
            trust,
        },
    })
}

fn client_verifier(
    ca_path: &Path,
    mode: ClientAuthMode,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn ClientCertVerifier>, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert)?;
    }

    let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
    let builder = match mode {
        ClientAuthMode::Optional => builder.allow_unauthenticated(),
        _ => builder,
    };
    builder.build().map_err(|e| TlsSetupError::Verifier(e.to_string()))
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::Read {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsSetupError::Read {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.display().to_string()))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsSetupError::Read {
            path: path.display().to_string(),
            source,
        })
}
