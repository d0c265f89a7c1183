//! Session issuing, validation and revocation.
//!
//! # Responsibilities
//! - Issue unguessable session tokens bound to a user
//! - Enforce the fixed session lifetime (optionally sliding)
//! - Revoke single sessions or every session of a user
//! - Render the session cookie with the configured flags
//!
//! # Design Decisions
//! - Each token's record lives in one `DashMap` shard and every state
//!   change happens under that shard's write lock, so concurrent
//!   validations of one token agree on its expiry
//! - `Active -> Expired` and `Active -> Revoked` are the only transitions;
//!   terminal records stay as tombstones until the next purge
//! - Sliding renewal is off unless configured; without it only `renew`
//!   moves `expires_at`

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::auth::principal::UserId;
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

const TOKEN_BYTES: usize = 32;

/// Upper bound that keeps `issued_at + lifetime` representable.
pub const MAX_LIFETIME_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Opaque session token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
        }
    }
}

/// Attributes of the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieFlags {
    pub name: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

/// Whether the transport a session is issued over is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    Tls,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session expired")]
    Expired,

    #[error("session unknown")]
    Unknown,

    #[error("session revoked")]
    Revoked,

    #[error("refusing to issue a secure session cookie over an insecure transport")]
    InsecureTransport,
}

impl SessionError {
    /// Session failures all require a new sign-in, never a retry.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// An issued session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cookie: CookieFlags,
}

impl Session {
    /// `Set-Cookie` header value for this session.
    pub fn set_cookie_header(&self) -> String {
        let max_age = (self.expires_at - self.issued_at).num_seconds().max(0);
        let mut header = format!(
            "{}={}; Max-Age={}; Path=/",
            self.cookie.name,
            self.token.as_str(),
            max_age
        );
        if self.cookie.http_only {
            header.push_str("; HttpOnly");
        }
        header.push_str("; SameSite=");
        header.push_str(self.cookie.same_site.as_str());
        if self.cookie.secure {
            header.push_str("; Secure");
        }
        header
    }
}

/// Immutable session policy.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub lifetime: chrono::Duration,
    pub sliding_renewal: bool,
    pub cookie: CookieFlags,
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            lifetime: chrono::Duration::seconds(config.lifetime_secs.min(MAX_LIFETIME_SECS) as i64),
            sliding_renewal: config.sliding_renewal,
            cookie: CookieFlags {
                name: config.cookie_name.clone(),
                secure: config.secure_cookies,
                http_only: true,
                same_site: SameSite::Strict,
            },
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    session: Session,
    state: SessionState,
}

/// Owns every session record.
pub struct SessionManager {
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    sessions: DashMap<SessionToken, SessionRecord>,
}

impl SessionManager {
    pub fn new(policy: SessionPolicy, clock: Arc<dyn Clock>) -> Self {
        tracing::info!(
            component = "session",
            lifetime_secs = policy.lifetime.num_seconds(),
            sliding_renewal = policy.sliding_renewal,
            secure_cookies = policy.cookie.secure,
            "Session manager ready"
        );
        Self {
            policy,
            clock,
            sessions: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Issue a new session for `user_id`.
    pub fn issue(&self, user_id: UserId, transport: TransportSecurity) -> Result<Session, SessionError> {
        if self.policy.cookie.secure && transport == TransportSecurity::Plain {
            tracing::warn!(
                component = "session",
                user_id = %user_id,
                "Refused to issue secure session over plain transport"
            );
            return Err(SessionError::InsecureTransport);
        }

        let now = self.clock.now();
        let session = Session {
            token: SessionToken::generate(),
            user_id,
            issued_at: now,
            expires_at: now + self.policy.lifetime,
            cookie: self.policy.cookie.clone(),
        };
        self.sessions.insert(
            session.token.clone(),
            SessionRecord {
                session: session.clone(),
                state: SessionState::Active,
            },
        );

        metrics::record_session_issued();
        tracing::debug!(component = "session", user_id = %user_id, "Session issued");
        Ok(session)
    }

    /// Resolve a token to its user.
    pub fn validate(&self, token: &SessionToken) -> Result<UserId, SessionError> {
        let Some(mut record) = self.sessions.get_mut(token) else {
            return Err(SessionError::Unknown);
        };

        match record.state {
            SessionState::Revoked => Err(SessionError::Revoked),
            SessionState::Expired => Err(SessionError::Expired),
            SessionState::Active => {
                let now = self.clock.now();
                if now >= record.session.expires_at {
                    record.state = SessionState::Expired;
                    metrics::record_session_expired();
                    tracing::debug!(
                        component = "session",
                        user_id = %record.session.user_id,
                        "Session expired"
                    );
                    return Err(SessionError::Expired);
                }
                if self.policy.sliding_renewal {
                    record.session.expires_at = now + self.policy.lifetime;
                }
                Ok(record.session.user_id)
            }
        }
    }

    /// Explicitly extend an active session by one lifetime from now.
    pub fn renew(&self, token: &SessionToken) -> Result<Session, SessionError> {
        self.validate(token)?;
        let mut record = self.sessions.get_mut(token).ok_or(SessionError::Unknown)?;
        if record.state != SessionState::Active {
            return Err(SessionError::Revoked);
        }
        record.session.expires_at = self.clock.now() + self.policy.lifetime;
        Ok(record.session.clone())
    }

    /// Revoke a session. Unknown or already terminal tokens are a no-op.
    /// Returns `true` if this call revoked an active session.
    pub fn revoke(&self, token: &SessionToken) -> bool {
        let Some(mut record) = self.sessions.get_mut(token) else {
            return false;
        };
        if record.state != SessionState::Active {
            return false;
        }
        record.state = SessionState::Revoked;
        metrics::record_sessions_revoked(1);
        tracing::debug!(component = "session", user_id = %record.session.user_id, "Session revoked");
        true
    }

    /// Revoke every active session of a user.
    pub fn revoke_all(&self, user_id: UserId) -> usize {
        let mut revoked = 0;
        for mut entry in self.sessions.iter_mut() {
            let record = entry.value_mut();
            if record.session.user_id == user_id && record.state == SessionState::Active {
                record.state = SessionState::Revoked;
                revoked += 1;
            }
        }
        if revoked > 0 {
            metrics::record_sessions_revoked(revoked);
            tracing::info!(component = "session", user_id = %user_id, count = revoked, "User sessions revoked");
        }
        revoked
    }

    /// Current state of a token, if it is still tracked.
    pub fn state(&self, token: &SessionToken) -> Option<SessionState> {
        self.sessions.get(token).map(|record| record.state)
    }

    pub fn session(&self, token: &SessionToken) -> Option<Session> {
        self.sessions.get(token).map(|record| record.session.clone())
    }

    /// Sessions that are active and not yet past their expiry.
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.sessions
            .iter()
            .filter(|record| record.state == SessionState::Active && record.session.expires_at > now)
            .count()
    }

    /// Drop expired and revoked records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, record| record.state == SessionState::Active && record.session.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    /// Periodically purge terminal records until shutdown.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = manager.purge_expired();
                        if removed > 0 {
                            tracing::debug!(component = "session", removed, "Purged terminal sessions");
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.policy)
            .field("tracked", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager(lifetime_secs: u64, sliding: bool) -> (Arc<ManualClock>, SessionManager) {
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig {
            lifetime_secs,
            sliding_renewal: sliding,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(SessionPolicy::from(&config), clock.clone());
        (clock, manager)
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn validate_without_sliding_keeps_expiry() {
        let (clock, manager) = manager(10, false);
        let user = UserId::new();
        let session = manager.issue(user, TransportSecurity::Tls).unwrap();
        assert_eq!(session.expires_at, session.issued_at + secs(10));

        clock.advance(secs(5));
        assert_eq!(manager.validate(&session.token), Ok(user));
        assert_eq!(
            manager.session(&session.token).unwrap().expires_at,
            session.expires_at
        );

        clock.advance(secs(6));
        assert_eq!(manager.validate(&session.token), Err(SessionError::Expired));
        assert_eq!(manager.state(&session.token), Some(SessionState::Expired));
    }

    #[test]
    fn expiry_boundary() {
        let (clock, manager) = manager(60, false);
        let session = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();

        clock.advance(secs(59));
        assert!(manager.validate(&session.token).is_ok());

        clock.advance(secs(2));
        assert_eq!(manager.validate(&session.token), Err(SessionError::Expired));

        // Expired is terminal even if the clock is wound back.
        clock.set(session.issued_at);
        assert_eq!(manager.validate(&session.token), Err(SessionError::Expired));
    }

    #[test]
    fn sliding_renewal_extends_on_validate() {
        let (clock, manager) = manager(10, true);
        let session = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();

        for _ in 0..5 {
            clock.advance(secs(8));
            assert!(manager.validate(&session.token).is_ok());
        }
        clock.advance(secs(11));
        assert_eq!(manager.validate(&session.token), Err(SessionError::Expired));
    }

    #[test]
    fn explicit_renew_moves_expiry() {
        let (clock, manager) = manager(10, false);
        let session = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();

        clock.advance(secs(8));
        let renewed = manager.renew(&session.token).unwrap();
        assert_eq!(renewed.expires_at, clock.now() + secs(10));

        clock.advance(secs(8));
        assert!(manager.validate(&session.token).is_ok());
    }

    #[test]
    fn revoke_is_idempotent() {
        let (_clock, manager) = manager(60, false);
        let session = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();

        assert!(manager.revoke(&session.token));
        assert!(!manager.revoke(&session.token));
        assert!(!manager.revoke(&SessionToken::from("never-issued")));

        assert_eq!(manager.validate(&session.token), Err(SessionError::Revoked));
        assert_eq!(
            manager.validate(&SessionToken::from("never-issued")),
            Err(SessionError::Unknown)
        );
        assert!(manager.renew(&session.token).is_err());
    }

    #[test]
    fn revoke_all_only_touches_one_user() {
        let (_clock, manager) = manager(60, false);
        let alice = UserId::new();
        let a1 = manager.issue(alice, TransportSecurity::Tls).unwrap();
        let _a2 = manager.issue(alice, TransportSecurity::Tls).unwrap();
        let b = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();

        assert_eq!(manager.revoke_all(alice), 2);
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.validate(&a1.token), Err(SessionError::Revoked));
        assert!(manager.validate(&b.token).is_ok());
    }

    #[test]
    fn purge_removes_terminal_records() {
        let (clock, manager) = manager(10, false);
        let expired = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();
        let revoked = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();
        manager.revoke(&revoked.token);

        clock.advance(secs(5));
        let live = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();
        clock.advance(secs(6));

        assert_eq!(manager.purge_expired(), 2);
        assert_eq!(manager.validate(&expired.token), Err(SessionError::Unknown));
        assert_eq!(manager.validate(&revoked.token), Err(SessionError::Unknown));
        assert!(manager.validate(&live.token).is_ok());
    }

    #[test]
    fn secure_cookies_refuse_plain_transport() {
        let (_clock, manager) = manager(60, false);
        assert_eq!(
            manager.issue(UserId::new(), TransportSecurity::Plain).unwrap_err(),
            SessionError::InsecureTransport
        );
    }

    #[test]
    fn cookie_header_carries_flags() {
        let (_clock, manager) = manager(3600, false);
        let session = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();
        let header = session.set_cookie_header();

        assert!(header.starts_with(&format!("gatehouse_session={}", session.token.as_str())));
        assert!(header.contains("Max-Age=3600"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.ends_with("; Secure"));
    }

    #[test]
    fn insecure_policy_omits_secure_flag() {
        let config = SessionConfig {
            secure_cookies: false,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(SessionPolicy::from(&config), Arc::new(ManualClock::default()));
        let session = manager.issue(UserId::new(), TransportSecurity::Plain).unwrap();
        assert!(!session.set_cookie_header().contains("Secure"));
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let (_clock, manager) = manager(60, false);
        let user = UserId::new();
        let a = manager.issue(user, TransportSecurity::Tls).unwrap();
        let b = manager.issue(user, TransportSecurity::Tls).unwrap();

        assert_ne!(a.token, b.token);
        assert_eq!(a.token.as_str().len(), 43);
        assert!(a
            .token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn concurrent_validation_agrees_on_expiry() {
        let (clock, manager) = manager(10, false);
        let manager = Arc::new(manager);
        let session = manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();
        clock.advance(secs(10));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let token = session.token.clone();
                std::thread::spawn(move || manager.validate(&token))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(SessionError::Expired));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_purges_and_stops_on_shutdown() {
        let (clock, manager) = manager(10, false);
        let manager = Arc::new(manager);
        manager.issue(UserId::new(), TransportSecurity::Tls).unwrap();
        clock.advance(secs(11));

        let shutdown = Shutdown::new();
        let task = manager.spawn_cleanup(Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(manager.purge_expired(), 0, "cleanup already ran");

        shutdown.trigger();
        task.await.unwrap();
    }
}
