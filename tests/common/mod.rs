//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use gatehouse::auth::password::{Argon2Hasher, CredentialHasher};
use gatehouse::config::{ClientAuthMode, GatehouseConfig, TlsConfig};
use gatehouse::net::tls::{load_certs, load_private_key};
use gatehouse::notifications::{Channel, DeliveryError, MessageSender, NotificationKind};
use gatehouse::{Gatehouse, GatehouseBuilder};

/// Loopback config with an ephemeral port and cheap defaults.
pub fn test_config() -> GatehouseConfig {
    let mut config = GatehouseConfig::default();
    config.service_name = "gatehouse-test".to_string();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.drain_timeout_secs = 1;
    config.session.secure_cookies = false;
    config
}

/// Argon2 with minimal cost so tests stay fast.
pub fn fast_hasher() -> Arc<dyn CredentialHasher> {
    Arc::new(Argon2Hasher::with_cost(8, 1, 1))
}

pub fn builder(config: GatehouseConfig) -> GatehouseBuilder {
    Gatehouse::builder(config).with_hasher(fast_hasher())
}

/// Build, start and return the server with its bound address.
pub async fn start(builder: GatehouseBuilder) -> (Gatehouse, SocketAddr) {
    let server = builder.build().expect("server builds");
    let addr = server.start().await.expect("server starts");
    (server, addr)
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Counts deliveries, optionally failing every one.
#[derive(Debug, Default)]
pub struct RecordingSender {
    pub attempts: AtomicUsize,
    pub fail: bool,
}

impl RecordingSender {
    pub fn failing() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, recipient: &str, _template: NotificationKind, _payload: &Value) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DeliveryError {
                channel: Channel::Email,
                recipient: recipient.to_string(),
                reason: "smtp relay unreachable".to_string(),
            });
        }
        Ok(())
    }
}

/// Throwaway CA plus server and client certificates written as PEM files.
pub struct TestPki {
    dir: TempDir,
    ca: Certificate,
    pub ca_path: PathBuf,
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
}

impl TestPki {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut ca_params = CertificateParams::new(Vec::new());
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = DistinguishedName::new();
        ca_params.distinguished_name.push(DnType::CommonName, "gatehouse test ca");
        let ca = Certificate::from_params(ca_params).unwrap();

        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, ca.serialize_pem().unwrap()).unwrap();

        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]);
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = Certificate::from_params(server_params).unwrap();
        let server_cert_path = dir.path().join("server.pem");
        let server_key_path = dir.path().join("server.key");
        fs::write(&server_cert_path, server.serialize_pem_with_signer(&ca).unwrap()).unwrap();
        fs::write(&server_key_path, server.serialize_private_key_pem()).unwrap();

        Self {
            dir,
            ca,
            ca_path,
            server_cert_path,
            server_key_path,
        }
    }

    /// Issue a client certificate with the given common name.
    pub fn client_identity(&self, common_name: &str) -> (PathBuf, PathBuf) {
        let mut params = CertificateParams::new(Vec::new());
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = Certificate::from_params(params).unwrap();

        let cert_path = self.dir.path().join(format!("{common_name}.pem"));
        let key_path = self.dir.path().join(format!("{common_name}.key"));
        fs::write(&cert_path, client.serialize_pem_with_signer(&self.ca).unwrap()).unwrap();
        fs::write(&key_path, client.serialize_private_key_pem()).unwrap();
        (cert_path, key_path)
    }

    pub fn tls_config(&self, client_auth: ClientAuthMode) -> TlsConfig {
        TlsConfig {
            cert_path: self.server_cert_path.display().to_string(),
            key_path: self.server_key_path.display().to_string(),
            client_ca_path: Some(self.ca_path.display().to_string()),
            protocols: vec!["1.2".to_string(), "1.3".to_string()],
            client_auth,
        }
    }

    /// TLS connect to `addr`, presenting `identity` when given.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        identity: Option<&(PathBuf, PathBuf)>,
    ) -> std::io::Result<TlsStream<TcpStream>> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_path).unwrap() {
            roots.add(cert).unwrap();
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
        let config = match identity {
            Some((cert_path, key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path).unwrap(), load_private_key(key_path).unwrap())
                .unwrap(),
            None => builder.with_no_client_auth(),
        };

        let stream = TcpStream::connect(addr).await?;
        let server_name = ServerName::try_from("localhost").unwrap();
        TlsConnector::from(Arc::new(config)).connect(server_name, stream).await
    }
}
