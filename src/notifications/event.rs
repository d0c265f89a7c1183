//! Lifecycle notification events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::auth::principal::UserId;

/// What happened to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    SignUp,
    Welcome,
    PasswordReset,
    PasswordChanged,
}

impl NotificationKind {
    /// Template key handed to the delivery collaborator.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SignUp => "sign_up",
            NotificationKind::Welcome => "welcome",
            NotificationKind::PasswordReset => "password_reset",
            NotificationKind::PasswordChanged => "password_changed",
        }
    }

    /// Whether administrators are told about this kind of event.
    pub fn notifies_admins(&self) -> bool {
        matches!(self, NotificationKind::SignUp | NotificationKind::PasswordChanged)
    }

    /// Whether the account holder is told about this kind of event.
    pub fn notifies_account(&self) -> bool {
        !matches!(self, NotificationKind::SignUp)
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The account an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    pub user_id: UserId,
    pub user_name: String,
    pub email: Option<String>,
}

/// A transient lifecycle event. Built and handed straight to the dispatcher.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub target: NotificationTarget,
    pub timestamp: DateTime<Utc>,
    /// Kind-specific extras, e.g. the reset token.
    pub details: Value,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, target: NotificationTarget, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            target,
            timestamp,
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Payload passed to senders alongside the template key.
    pub fn payload(&self) -> Value {
        json!({
            "kind": self.kind.as_str(),
            "user_id": self.target.user_id.to_string(),
            "user_name": self.target.user_name,
            "timestamp": self.timestamp.to_rfc3339(),
            "details": self.details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_target_and_details() {
        let user_id = UserId::new();
        let event = NotificationEvent::new(
            NotificationKind::PasswordReset,
            NotificationTarget {
                user_id,
                user_name: "alice@default".into(),
                email: Some("alice@example.com".into()),
            },
            Utc::now(),
        )
        .with_details(json!({ "reset_token": "abc" }));

        let payload = event.payload();
        assert_eq!(payload["kind"], "password_reset");
        assert_eq!(payload["user_id"], user_id.to_string());
        assert_eq!(payload["details"]["reset_token"], "abc");
    }

    #[test]
    fn audience_by_kind() {
        assert!(NotificationKind::SignUp.notifies_admins());
        assert!(!NotificationKind::SignUp.notifies_account());
        assert!(NotificationKind::Welcome.notifies_account());
        assert!(!NotificationKind::PasswordReset.notifies_admins());
        assert!(NotificationKind::PasswordChanged.notifies_admins());
        assert!(NotificationKind::PasswordChanged.notifies_account());
    }
}
