//! Account management flows.
//!
//! Sign-up, sign-in, sign-out, password change and password reset,
//! composed from the resolver, the session manager, the password policy
//! and the notification dispatcher. Every state change commits before its
//! notification is queued; delivery never affects the outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::auth::certificate::{PrincipalHint, TlsIdentity};
use crate::auth::password::PasswordPolicy;
use crate::auth::principal::{Account, AuthError, Credential, PrincipalResolver, UserId};
use crate::auth::session::{Session, SessionError, SessionManager, SessionToken, TransportSecurity};
use crate::clock::Clock;
use crate::lifecycle::Shutdown;
use crate::notifications::{NotificationDispatcher, NotificationEvent, NotificationKind, NotificationTarget};

#[derive(Debug, Clone)]
struct ResetTicket {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

pub struct AccountService {
    resolver: PrincipalResolver,
    sessions: Arc<SessionManager>,
    password_policy: Arc<dyn PasswordPolicy>,
    notifier: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    reset_lifetime: chrono::Duration,
    reset_tickets: DashMap<String, ResetTicket>,
}

impl AccountService {
    pub fn new(
        resolver: PrincipalResolver,
        sessions: Arc<SessionManager>,
        password_policy: Arc<dyn PasswordPolicy>,
        notifier: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        reset_lifetime: chrono::Duration,
    ) -> Self {
        Self {
            resolver,
            sessions,
            password_policy,
            notifier,
            clock,
            reset_lifetime,
            reset_tickets: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &PrincipalResolver {
        &self.resolver
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Register a new account.
    pub fn sign_up(&self, user_name: &str, password: &str, email: Option<&str>) -> Result<Account, AuthError> {
        let user_name = self.resolver.rules().normalize(user_name)?;
        self.password_policy.check(password)?;

        let store = self.resolver.store();
        if store.get_account(&user_name)?.is_some() {
            return Err(AuthError::UserNameTaken);
        }

        let account = Account {
            user_id: UserId::new(),
            user_name,
            password_hash: self.resolver.hasher().hash(password)?,
            email: email.map(str::to_string),
            created_at: self.clock.now(),
        };
        store.put_account(account.clone())?;

        tracing::info!(
            component = "accounts",
            user_id = %account.user_id,
            user_name = %account.user_name,
            "Account created"
        );
        self.notify(NotificationKind::SignUp, &account);
        self.notify(NotificationKind::Welcome, &account);
        Ok(account)
    }

    /// Verify a password and issue a session.
    pub fn sign_in(
        &self,
        user_name: &str,
        password: &str,
        transport: TransportSecurity,
    ) -> Result<Session, AuthError> {
        let user_id = self.resolver.resolve(Credential::Password { user_name, password })?;
        Ok(self.sessions.issue(user_id, transport)?)
    }

    /// Issue a session for a peer identified by its client certificate.
    pub fn sign_in_with_certificate(
        &self,
        identity: &TlsIdentity,
        transport: TransportSecurity,
    ) -> Result<Session, AuthError> {
        let user_id = self.resolver.resolve(Credential::Certificate(identity))?;
        Ok(self.sessions.issue(user_id, transport)?)
    }

    /// Revoke a session. Unknown tokens are not an error.
    pub fn sign_out(&self, token: &SessionToken) -> bool {
        self.sessions.revoke(token)
    }

    /// The account behind a session.
    pub fn whoami(&self, token: &SessionToken) -> Result<Account, AuthError> {
        let user_id = self.sessions.validate(token)?;
        self.resolver
            .store()
            .get_account_by_id(user_id)?
            .ok_or(AuthError::Session(SessionError::Unknown))
    }

    /// Change the password of the signed-in user. Revokes every session of
    /// the user, including the one used for the change.
    pub fn change_password(
        &self,
        token: &SessionToken,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let account = self.whoami(token)?;
        self.resolver
            .authenticate(&account.user_name.key(), current_password)?;
        self.password_policy.check(new_password)?;

        self.replace_password(account, new_password)
    }

    /// Start a password reset. Succeeds identically whether or not the
    /// account exists; the reset token only travels in the notification.
    pub fn request_password_reset(&self, user_name: &str) -> Result<(), AuthError> {
        let user_name = self.resolver.rules().normalize(user_name)?;
        self.purge_reset_tickets();
        let Some(account) = self.resolver.store().get_account(&user_name)? else {
            tracing::debug!(component = "accounts", "Password reset requested for unknown account");
            return Ok(());
        };

        let token = generate_reset_token();
        let expires_at = self.clock.now() + self.reset_lifetime;
        self.reset_tickets.insert(
            token.clone(),
            ResetTicket {
                user_id: account.user_id,
                expires_at,
            },
        );

        tracing::info!(component = "accounts", user_id = %account.user_id, "Password reset requested");
        self.notifier.dispatch(
            NotificationEvent::new(NotificationKind::PasswordReset, target(&account), self.clock.now())
                .with_details(json!({
                    "reset_token": token,
                    "expires_at": expires_at.to_rfc3339(),
                })),
        );
        Ok(())
    }

    /// Complete a password reset with a single-use token.
    pub fn reset_password(&self, reset_token: &str, new_password: &str) -> Result<(), AuthError> {
        // Checked first so a weak password does not burn the token.
        self.password_policy.check(new_password)?;

        let (_, ticket) = self
            .reset_tickets
            .remove(reset_token)
            .ok_or(AuthError::InvalidResetToken)?;
        if self.clock.now() >= ticket.expires_at {
            return Err(AuthError::InvalidResetToken);
        }

        let account = self
            .resolver
            .store()
            .get_account_by_id(ticket.user_id)?
            .ok_or(AuthError::InvalidResetToken)?;
        self.replace_password(account, new_password)
    }

    /// Bind a certificate principal to an account.
    pub fn bind_certificate(&self, principal: PrincipalHint, user_id: UserId) -> Result<(), AuthError> {
        tracing::info!(component = "accounts", principal = %principal, user_id = %user_id, "Certificate bound");
        Ok(self.resolver.store().put_binding(principal, user_id)?)
    }

    /// Drop expired reset tickets.
    pub fn purge_reset_tickets(&self) -> usize {
        let now = self.clock.now();
        let before = self.reset_tickets.len();
        self.reset_tickets.retain(|_, ticket| ticket.expires_at > now);
        before.saturating_sub(self.reset_tickets.len())
    }

    /// Periodically drop expired reset tickets and idle throttle buckets.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tickets = service.purge_reset_tickets();
                        let buckets = service.resolver.prune_throttle();
                        if tickets + buckets > 0 {
                            tracing::debug!(component = "accounts", tickets, buckets, "Pruned idle account state");
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    }

    fn replace_password(&self, mut account: Account, new_password: &str) -> Result<(), AuthError> {
        account.password_hash = self.resolver.hasher().hash(new_password)?;
        self.resolver.store().put_account(account.clone())?;

        let revoked = self.sessions.revoke_all(account.user_id);
        let user_id = account.user_id;
        self.reset_tickets.retain(|_, ticket| ticket.user_id != user_id);
        tracing::info!(
            component = "accounts",
            user_id = %account.user_id,
            sessions_revoked = revoked,
            "Password changed"
        );
        self.notify(NotificationKind::PasswordChanged, &account);
        Ok(())
    }

    fn notify(&self, kind: NotificationKind, account: &Account) {
        self.notifier
            .dispatch(NotificationEvent::new(kind, target(account), self.clock.now()));
    }
}

impl fmt::Debug for AccountService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountService")
            .field("resolver", &self.resolver)
            .field("sessions", &self.sessions)
            .field("pending_resets", &self.reset_tickets.len())
            .finish_non_exhaustive()
    }
}

fn target(account: &Account) -> NotificationTarget {
    NotificationTarget {
        user_id: account.user_id,
        user_name: account.user_name.key(),
        email: account.email.clone(),
    }
}

fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
