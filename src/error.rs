//! Crate-level error taxonomy.
//!
//! Each component owns a narrow error enum; `GatehouseError` folds them into
//! the categories outer layers act on: retry later, re-authenticate, or fix
//! the input.

use thiserror::Error;

use crate::auth::certificate::RejectReason;
use crate::auth::password::PolicyViolation;
use crate::auth::principal::AuthError;
use crate::auth::session::SessionError;
use crate::net::admission::Rejected;
use crate::notifications::DeliveryError;

/// Failure of the persistence collaborator.
#[derive(Debug, Clone, Error)]
#[error("storage unavailable: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Every failure the engine surfaces to its callers.
#[derive(Debug, Error)]
pub enum GatehouseError {
    #[error(transparent)]
    AdmissionRejected(#[from] Rejected),

    #[error("certificate rejected: {0}")]
    Certificate(RejectReason),

    #[error(transparent)]
    Auth(AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl GatehouseError {
    /// Transient failures the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatehouseError::AdmissionRejected(_) | GatehouseError::Delivery(_) => true,
            GatehouseError::Auth(err) => err.is_retryable(),
            GatehouseError::Session(err) => err.is_retryable(),
            GatehouseError::Certificate(_) | GatehouseError::PolicyViolation(_) => false,
        }
    }

    /// Failures that require the peer to authenticate again.
    pub fn requires_authentication(&self) -> bool {
        match self {
            GatehouseError::Certificate(_) | GatehouseError::Session(_) => true,
            GatehouseError::Auth(err) => matches!(
                err,
                AuthError::InvalidCredentials | AuthError::InvalidUserName | AuthError::UnboundCertificate
            ),
            _ => false,
        }
    }
}

impl From<AuthError> for GatehouseError {
    /// Lifts nested certificate, session and policy failures to their own
    /// categories.
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::CertificateInvalid(reason) => GatehouseError::Certificate(reason),
            AuthError::Session(err) => GatehouseError::Session(err),
            AuthError::PolicyViolation(violation) => GatehouseError::PolicyViolation(violation),
            other => GatehouseError::Auth(other),
        }
    }
}

impl From<StorageError> for GatehouseError {
    fn from(err: StorageError) -> Self {
        GatehouseError::Auth(AuthError::StorageUnavailable(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_auth_failures_are_lifted() {
        let err = GatehouseError::from(AuthError::Session(SessionError::Expired));
        assert!(matches!(err, GatehouseError::Session(SessionError::Expired)));
        assert!(err.requires_authentication());

        let err = GatehouseError::from(AuthError::PolicyViolation(PolicyViolation::new("too short")));
        assert!(matches!(err, GatehouseError::PolicyViolation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_categories() {
        assert!(GatehouseError::from(Rejected::AtCapacity { limit: 1 }).is_retryable());
        assert!(GatehouseError::from(StorageError::new("down")).is_retryable());
        assert!(!GatehouseError::from(AuthError::InvalidCredentials).is_retryable());
        assert!(GatehouseError::from(AuthError::InvalidCredentials).requires_authentication());
        assert!(GatehouseError::Certificate(RejectReason::CertificateRequired).requires_authentication());
    }
}
