//! Client certificate policy and principal hint extraction.
//!
//! # Responsibilities
//! - Decide, per handshake, whether the presented client certificate
//!   satisfies the configured policy
//! - Extract a stable principal hint (subject CN, else the full subject DN)
//!
//! # Design Decisions
//! - Cryptographic chain verification is delegated to a `TrustChainCheck`;
//!   this module only orchestrates
//! - A missing certificate under `Required` is a rejection, never a silent
//!   downgrade to anonymous

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::ProtocolVersion;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::ClientAuthMode;

/// TLS protocol versions the policy can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse a configuration value ("1.2" or "1.3").
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1.2" => Some(TlsVersion::Tls12),
            "1.3" => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    pub fn from_rustls(version: ProtocolVersion) -> Option<Self> {
        match version {
            ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
            ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    pub fn to_rustls(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Cryptographic verification of a presented certificate chain.
pub trait TrustChainCheck: Send + Sync {
    /// `chain[0]` is the end-entity certificate, the rest are intermediates.
    fn verify(&self, chain: &[CertificateDer<'static>]) -> Result<(), String>;
}

/// Chain verification against a CA bundle through rustls' WebPKI verifier.
pub struct WebPkiChainCheck {
    verifier: Arc<dyn ClientCertVerifier>,
}

impl WebPkiChainCheck {
    pub fn new(verifier: Arc<dyn ClientCertVerifier>) -> Self {
        Self { verifier }
    }
}

impl TrustChainCheck for WebPkiChainCheck {
    fn verify(&self, chain: &[CertificateDer<'static>]) -> Result<(), String> {
        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or_else(|| "empty certificate chain".to_string())?;
        self.verifier
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Policy applied to every TLS handshake.
#[derive(Clone)]
pub struct CertificatePolicy {
    pub allowed_versions: Vec<TlsVersion>,
    pub client_auth: ClientAuthMode,
    pub trust: Arc<dyn TrustChainCheck>,
}

impl fmt::Debug for CertificatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificatePolicy")
            .field("allowed_versions", &self.allowed_versions)
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

/// Stable identifier derived from a validated client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalHint(String);

impl PrincipalHint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a handshake's certificate was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("client certificate required but none was presented")]
    CertificateRequired,

    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    #[error("protocol version {0:?} is not allowed")]
    ProtocolNotAllowed(Option<TlsVersion>),
}

/// Outcome of certificate validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A valid certificate identified the peer.
    Accepted(PrincipalHint),
    /// No certificate was presented and the policy allows that.
    Anonymous,
    Rejected(RejectReason),
}

/// What the TLS layer learned about the peer.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates {
    pub chain: Vec<CertificateDer<'static>>,
    pub protocol: Option<TlsVersion>,
}

impl PeerCertificates {
    pub fn from_connection(connection: &rustls::ServerConnection) -> Self {
        Self {
            chain: connection
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default(),
            protocol: connection.protocol_version().and_then(TlsVersion::from_rustls),
        }
    }
}

/// Per-handshake identity. Derived on every handshake, never persisted.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub principal_hint: Option<PrincipalHint>,
    pub verdict: Verdict,
}

impl TlsIdentity {
    pub fn establish(peer: PeerCertificates, policy: &CertificatePolicy) -> Self {
        let verdict = CertificateValidator::validate(&peer, policy);
        let principal_hint = match &verdict {
            Verdict::Accepted(hint) => Some(hint.clone()),
            _ => None,
        };
        Self {
            chain: peer.chain,
            principal_hint,
            verdict,
        }
    }
}

/// Applies a `CertificatePolicy` to a handshake.
pub struct CertificateValidator;

impl CertificateValidator {
    pub fn validate(peer: &PeerCertificates, policy: &CertificatePolicy) -> Verdict {
        if !policy.allowed_versions.is_empty()
            && !peer
                .protocol
                .is_some_and(|version| policy.allowed_versions.contains(&version))
        {
            return reject(RejectReason::ProtocolNotAllowed(peer.protocol));
        }

        if peer.chain.is_empty() || policy.client_auth == ClientAuthMode::Disabled {
            return match policy.client_auth {
                ClientAuthMode::Required => reject(RejectReason::CertificateRequired),
                _ => Verdict::Anonymous,
            };
        }

        if let Err(reason) = policy.trust.verify(&peer.chain) {
            return reject(RejectReason::CertificateInvalid(reason));
        }

        match extract_principal_hint(&peer.chain[0]) {
            Ok(hint) => {
                tracing::debug!(component = "certificate", principal = %hint, "Client certificate accepted");
                Verdict::Accepted(hint)
            }
            Err(reason) => reject(reason),
        }
    }
}

fn reject(reason: RejectReason) -> Verdict {
    tracing::warn!(component = "certificate", reason = %reason, "Client certificate rejected");
    Verdict::Rejected(reason)
}

/// Subject common name, or the full subject DN when there is no CN.
pub fn extract_principal_hint(der: &CertificateDer<'_>) -> Result<PrincipalHint, RejectReason> {
    let (_, certificate) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| RejectReason::CertificateInvalid(format!("unparseable certificate: {e}")))?;

    let subject = certificate.subject();
    if let Some(cn) = subject
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
        .map(str::trim)
        .find(|cn| !cn.is_empty())
    {
        return Ok(PrincipalHint::new(cn));
    }

    let dn = subject.to_string();
    if dn.is_empty() {
        return Err(RejectReason::CertificateInvalid(
            "certificate has an empty subject".to_string(),
        ));
    }
    Ok(PrincipalHint::new(dn))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Trust(Result<(), String>);

    impl TrustChainCheck for Trust {
        fn verify(&self, _chain: &[CertificateDer<'static>]) -> Result<(), String> {
            self.0.clone()
        }
    }

    fn policy(client_auth: ClientAuthMode, trust: Result<(), String>) -> CertificatePolicy {
        CertificatePolicy {
            allowed_versions: vec![TlsVersion::Tls12, TlsVersion::Tls13],
            client_auth,
            trust: Arc::new(Trust(trust)),
        }
    }

    fn certificate_for(common_name: &str) -> CertificateDer<'static> {
        let mut params = rcgen::CertificateParams::new(vec!["client.test".to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        CertificateDer::from(cert.serialize_der().unwrap())
    }

    fn peer(chain: Vec<CertificateDer<'static>>) -> PeerCertificates {
        PeerCertificates {
            chain,
            protocol: Some(TlsVersion::Tls13),
        }
    }

    #[test]
    fn required_but_absent_is_rejected() {
        let verdict = CertificateValidator::validate(&peer(vec![]), &policy(ClientAuthMode::Required, Ok(())));
        assert_eq!(verdict, Verdict::Rejected(RejectReason::CertificateRequired));
    }

    #[test]
    fn optional_and_absent_is_anonymous() {
        let verdict = CertificateValidator::validate(&peer(vec![]), &policy(ClientAuthMode::Optional, Ok(())));
        assert_eq!(verdict, Verdict::Anonymous);
    }

    #[test]
    fn failed_chain_check_is_certificate_invalid() {
        let verdict = CertificateValidator::validate(
            &peer(vec![certificate_for("alice")]),
            &policy(ClientAuthMode::Required, Err("unknown issuer".into())),
        );
        assert_eq!(
            verdict,
            Verdict::Rejected(RejectReason::CertificateInvalid("unknown issuer".into()))
        );
    }

    #[test]
    fn valid_certificate_yields_common_name() {
        let identity = TlsIdentity::establish(
            peer(vec![certificate_for("svc-billing")]),
            &policy(ClientAuthMode::Required, Ok(())),
        );
        assert_eq!(identity.verdict, Verdict::Accepted(PrincipalHint::new("svc-billing")));
        assert_eq!(identity.principal_hint, Some(PrincipalHint::new("svc-billing")));
    }

    #[test]
    fn disallowed_protocol_is_rejected_before_chain_check() {
        let mut policy = policy(ClientAuthMode::Required, Ok(()));
        policy.allowed_versions = vec![TlsVersion::Tls13];
        let peer = PeerCertificates {
            chain: vec![certificate_for("alice")],
            protocol: Some(TlsVersion::Tls12),
        };
        assert_eq!(
            CertificateValidator::validate(&peer, &policy),
            Verdict::Rejected(RejectReason::ProtocolNotAllowed(Some(TlsVersion::Tls12)))
        );
    }

    #[test]
    fn garbage_certificate_is_invalid() {
        let result = extract_principal_hint(&CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0xff]));
        assert!(matches!(result, Err(RejectReason::CertificateInvalid(_))));
    }

    #[test]
    fn parses_protocol_versions() {
        assert_eq!(TlsVersion::parse("1.3"), Some(TlsVersion::Tls13));
        assert_eq!(TlsVersion::parse(" 1.2 "), Some(TlsVersion::Tls12));
        assert_eq!(TlsVersion::parse("1.1"), None);
    }
}
