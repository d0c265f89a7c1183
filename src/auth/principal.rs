//! Credential to principal resolution.
//!
//! # Responsibilities
//! - Normalize user names (case, realm, length bounds)
//! - Resolve a password or TLS credential to a `UserId`
//! - Define the account persistence contract
//!
//! # Design Decisions
//! - Unknown users are verified against a dummy hash, so "no such user"
//!   and "wrong password" cost the same single verification and fail with
//!   the same error
//! - Throttling is applied before the lookup, keyed by the normalized
//!   name, so it behaves identically for known and unknown names
//! - The store is a synchronous key-value contract; its failures surface
//!   as `StorageUnavailable`

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::certificate::{PrincipalHint, RejectReason, TlsIdentity, Verdict};
use crate::auth::password::{CredentialHasher, HashError, PolicyViolation};
use crate::auth::session::SessionError;
use crate::auth::throttle::SignInThrottle;
use crate::config::AccountConfig;
use crate::error::StorageError;
use crate::observability::metrics;

/// Password used to build the dummy hash for unknown users.
const DUMMY_PASSWORD: &str = "gatehouse-timing-equalizer";

/// Internal account identifier. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A normalized user name: lowercase, with an explicit realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserName {
    name: String,
    realm: String,
}

impl UserName {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Lookup key, `name@realm`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.realm)
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.realm)
    }
}

/// User name normalization rules.
#[derive(Debug, Clone)]
pub struct NameRules {
    pub default_realm: String,
    pub min_username_length: usize,
    pub max_username_length: usize,
    pub min_realm_length: usize,
    pub max_realm_length: usize,
}

impl From<&AccountConfig> for NameRules {
    fn from(config: &AccountConfig) -> Self {
        Self {
            default_realm: config.default_realm.trim().to_lowercase(),
            min_username_length: config.min_username_length,
            max_username_length: config.max_username_length,
            min_realm_length: config.min_realm_length,
            max_realm_length: config.max_realm_length,
        }
    }
}

impl NameRules {
    /// Lowercase, split an optional `@realm` suffix and check both bounds.
    pub fn normalize(&self, raw: &str) -> Result<UserName, AuthError> {
        let lowered = raw.trim().to_lowercase();
        let (name, realm) = match lowered.rsplit_once('@') {
            Some((name, realm)) => (name.to_string(), realm.to_string()),
            None => (lowered, self.default_realm.clone()),
        };

        let name_len = name.chars().count();
        let realm_len = realm.chars().count();
        let well_formed = |s: &str| !s.chars().any(|c| c.is_whitespace() || c.is_control());

        if name_len < self.min_username_length
            || name_len > self.max_username_length
            || realm_len < self.min_realm_length
            || realm_len > self.max_realm_length
            || !well_formed(&name)
            || !well_formed(&realm)
        {
            return Err(AuthError::InvalidUserName);
        }
        Ok(UserName { name, realm })
    }
}

/// A registered account.
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: UserId,
    pub user_name: UserName,
    pub password_hash: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn realm(&self) -> &str {
        self.user_name.realm()
    }
}

/// Persistence collaborator for accounts and certificate bindings.
pub trait AccountStore: Send + Sync {
    fn get_account(&self, user_name: &UserName) -> Result<Option<Account>, StorageError>;

    fn get_account_by_id(&self, user_id: UserId) -> Result<Option<Account>, StorageError>;

    /// Insert or replace an account.
    fn put_account(&self, account: Account) -> Result<(), StorageError>;

    fn get_binding(&self, principal: &PrincipalHint) -> Result<Option<UserId>, StorageError>;

    fn put_binding(&self, principal: PrincipalHint, user_id: UserId) -> Result<(), StorageError>;
}

/// Process-local account store.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<UserId, Account>,
    by_name: DashMap<String, UserId>,
    bindings: DashMap<PrincipalHint, UserId>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get_account(&self, user_name: &UserName) -> Result<Option<Account>, StorageError> {
        Ok(self
            .by_name
            .get(&user_name.key())
            .and_then(|id| self.accounts.get(id.value()).map(|a| a.clone())))
    }

    fn get_account_by_id(&self, user_id: UserId) -> Result<Option<Account>, StorageError> {
        Ok(self.accounts.get(&user_id).map(|a| a.clone()))
    }

    fn put_account(&self, account: Account) -> Result<(), StorageError> {
        self.by_name.insert(account.user_name.key(), account.user_id);
        self.accounts.insert(account.user_id, account);
        Ok(())
    }

    fn get_binding(&self, principal: &PrincipalHint) -> Result<Option<UserId>, StorageError> {
        Ok(self.bindings.get(principal).map(|id| *id))
    }

    fn put_binding(&self, principal: PrincipalHint, user_id: UserId) -> Result<(), StorageError> {
        self.bindings.insert(principal, user_id);
        Ok(())
    }
}

/// A credential presented for resolution.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    Password { user_name: &'a str, password: &'a str },
    Certificate(&'a TlsIdentity),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid user name")]
    InvalidUserName,

    #[error("certificate is not bound to an account")]
    UnboundCertificate,

    #[error("certificate rejected: {0}")]
    CertificateInvalid(RejectReason),

    #[error("too many sign-in attempts")]
    Throttled,

    #[error("user name already taken")]
    UserNameTaken,

    #[error("invalid or expired reset token")]
    InvalidResetToken,

    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    #[error(transparent)]
    StorageUnavailable(#[from] StorageError),

    #[error(transparent)]
    Hashing(#[from] HashError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl AuthError {
    /// External-dependency failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::StorageUnavailable(_) | AuthError::Hashing(_) | AuthError::Throttled
        )
    }

    /// Short machine-readable kind, used for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::InvalidUserName => "invalid_user_name",
            AuthError::UnboundCertificate => "unbound_certificate",
            AuthError::CertificateInvalid(_) => "certificate_invalid",
            AuthError::Throttled => "throttled",
            AuthError::UserNameTaken => "user_name_taken",
            AuthError::InvalidResetToken => "invalid_reset_token",
            AuthError::PolicyViolation(_) => "policy_violation",
            AuthError::StorageUnavailable(_) => "storage_unavailable",
            AuthError::Hashing(_) => "hashing",
            AuthError::Session(_) => "session",
        }
    }

    /// Message safe to show to an unauthenticated peer. Credential failures
    /// collapse into one message so callers cannot tell which check failed.
    pub fn public_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials
            | AuthError::InvalidUserName
            | AuthError::UnboundCertificate
            | AuthError::CertificateInvalid(_) => "authentication failed".to_string(),
            AuthError::StorageUnavailable(_) | AuthError::Hashing(_) => {
                "service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Maps credentials to principals.
pub struct PrincipalResolver {
    store: Arc<dyn AccountStore>,
    hasher: Arc<dyn CredentialHasher>,
    rules: NameRules,
    throttle: Option<SignInThrottle>,
    dummy_hash: String,
}

impl PrincipalResolver {
    pub fn new(
        store: Arc<dyn AccountStore>,
        hasher: Arc<dyn CredentialHasher>,
        rules: NameRules,
        throttle: Option<SignInThrottle>,
    ) -> Result<Self, HashError> {
        let dummy_hash = hasher.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            store,
            hasher,
            rules,
            throttle,
            dummy_hash,
        })
    }

    pub fn rules(&self) -> &NameRules {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn hasher(&self) -> &Arc<dyn CredentialHasher> {
        &self.hasher
    }

    pub fn throttle(&self) -> Option<&SignInThrottle> {
        self.throttle.as_ref()
    }

    /// Drop throttle buckets that have fully refilled.
    pub fn prune_throttle(&self) -> usize {
        self.throttle.as_ref().map_or(0, SignInThrottle::prune)
    }

    /// Resolve a credential to the user it identifies.
    pub fn resolve(&self, credential: Credential<'_>) -> Result<UserId, AuthError> {
        let result = match credential {
            Credential::Password { user_name, password } => self
                .authenticate(user_name, password)
                .map(|account| account.user_id),
            Credential::Certificate(identity) => self.resolve_certificate(identity),
        };
        if let Err(err) = &result {
            metrics::record_auth_failure(err.kind());
            tracing::info!(component = "principal", error = %err, "Credential rejected");
        }
        result
    }

    /// Verify a user name and password and return the account.
    pub fn authenticate(&self, user_name: &str, password: &str) -> Result<Account, AuthError> {
        let user_name = self.rules.normalize(user_name)?;

        if let Some(throttle) = &self.throttle {
            if !throttle.check(&user_name.key()) {
                return Err(AuthError::Throttled);
            }
        }

        match self.store.get_account(&user_name)? {
            Some(account) => {
                if self.hasher.verify(password, &account.password_hash)? {
                    tracing::debug!(component = "principal", user_id = %account.user_id, "Password accepted");
                    Ok(account)
                } else {
                    Err(AuthError::InvalidCredentials)
                }
            }
            None => {
                // Same work as a real mismatch.
                let _ = self.hasher.verify(password, &self.dummy_hash)?;
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    fn resolve_certificate(&self, identity: &TlsIdentity) -> Result<UserId, AuthError> {
        match &identity.verdict {
            Verdict::Accepted(hint) => self
                .store
                .get_binding(hint)?
                .ok_or(AuthError::UnboundCertificate),
            Verdict::Rejected(reason) => Err(AuthError::CertificateInvalid(reason.clone())),
            Verdict::Anonymous => Err(AuthError::InvalidCredentials),
        }
    }
}

impl fmt::Debug for PrincipalResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrincipalResolver")
            .field("rules", &self.rules)
            .field("throttled", &self.throttle.is_some())
            .finish_non_exhaustive()
    }
}
