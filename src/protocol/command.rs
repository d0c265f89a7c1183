//! Line protocol commands and replies.
//!
//! One command per line, verb first, arguments separated by whitespace:
//!
//! ```text
//! SIGNUP <user> <password> [email]    → OK USER <id> <name>
//! SIGNIN <user> <password>            → OK SESSION <token> <expires-at>
//! CERT-SIGNIN                         → OK SESSION <token> <expires-at>
//! RESUME <token>                      → OK USER <id> <name>
//! WHOAMI                              → OK USER <id> <name>
//! SIGNOUT                             → OK
//! PASSWD <current> <new>              → OK
//! RESET-REQUEST <user>                → OK
//! RESET <reset-token> <new>           → OK
//! QUIT                                → BYE
//! ```
//!
//! Failures reply `ERR <CODE> <message>`.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::auth::principal::AuthError;
use crate::error::GatehouseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SignUp {
        user_name: String,
        password: String,
        email: Option<String>,
    },
    SignIn {
        user_name: String,
        password: String,
    },
    CertSignIn,
    Resume {
        token: String,
    },
    WhoAmI,
    SignOut,
    Passwd {
        current: String,
        new: String,
    },
    ResetRequest {
        user_name: String,
    },
    Reset {
        token: String,
        new_password: String,
    },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0}")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or(ParseError::Empty)?.to_ascii_uppercase();
        let args: Vec<&str> = parts.collect();

        let command = match (verb.as_str(), args.as_slice()) {
            ("SIGNUP", [user, password]) => Command::SignUp {
                user_name: user.to_string(),
                password: password.to_string(),
                email: None,
            },
            ("SIGNUP", [user, password, email]) => Command::SignUp {
                user_name: user.to_string(),
                password: password.to_string(),
                email: Some(email.to_string()),
            },
            ("SIGNUP", _) => return Err(ParseError::Usage("SIGNUP <user> <password> [email]")),
            ("SIGNIN", [user, password]) => Command::SignIn {
                user_name: user.to_string(),
                password: password.to_string(),
            },
            ("SIGNIN", _) => return Err(ParseError::Usage("SIGNIN <user> <password>")),
            ("CERT-SIGNIN", []) => Command::CertSignIn,
            ("RESUME", [token]) => Command::Resume {
                token: token.to_string(),
            },
            ("RESUME", _) => return Err(ParseError::Usage("RESUME <token>")),
            ("WHOAMI", []) => Command::WhoAmI,
            ("SIGNOUT", []) => Command::SignOut,
            ("PASSWD", [current, new]) => Command::Passwd {
                current: current.to_string(),
                new: new.to_string(),
            },
            ("PASSWD", _) => return Err(ParseError::Usage("PASSWD <current> <new>")),
            ("RESET-REQUEST", [user]) => Command::ResetRequest {
                user_name: user.to_string(),
            },
            ("RESET-REQUEST", _) => return Err(ParseError::Usage("RESET-REQUEST <user>")),
            ("RESET", [token, new]) => Command::Reset {
                token: token.to_string(),
                new_password: new.to_string(),
            },
            ("RESET", _) => return Err(ParseError::Usage("RESET <reset-token> <new>")),
            ("QUIT", []) => Command::Quit,
            ("CERT-SIGNIN" | "WHOAMI" | "SIGNOUT" | "QUIT", _) => {
                return Err(ParseError::Usage("command takes no arguments"))
            }
            (other, _) => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Credentials rejected; the peer must authenticate again.
    Auth,
    /// Session missing, expired or revoked.
    Session,
    /// New password rejected by the quality policy.
    Policy,
    /// User name already registered.
    Taken,
    /// Reset token unknown, used or expired.
    Reset,
    Throttled,
    /// Transient server-side failure.
    Retry,
    BadRequest,
    TooLong,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Auth => "AUTH",
            ErrorCode::Session => "SESSION",
            ErrorCode::Policy => "POLICY",
            ErrorCode::Taken => "TAKEN",
            ErrorCode::Reset => "RESET",
            ErrorCode::Throttled => "THROTTLED",
            ErrorCode::Retry => "RETRY",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::TooLong => "TOO_LONG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ready(String),
    Ok,
    Session {
        token: String,
        expires_at: DateTime<Utc>,
    },
    User {
        user_id: String,
        user_name: String,
    },
    Bye,
    Err {
        code: ErrorCode,
        message: String,
    },
}

impl Reply {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Err {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ready(service) => write!(f, "OK {service} ready"),
            Reply::Ok => f.write_str("OK"),
            Reply::Session { token, expires_at } => write!(
                f,
                "OK SESSION {token} {}",
                expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            Reply::User { user_id, user_name } => write!(f, "OK USER {user_id} {user_name}"),
            Reply::Bye => f.write_str("BYE"),
            Reply::Err { code, message } => write!(f, "ERR {} {message}", code.as_str()),
        }
    }
}

impl From<&GatehouseError> for Reply {
    fn from(err: &GatehouseError) -> Self {
        match err {
            GatehouseError::AdmissionRejected(e) => Reply::error(ErrorCode::Retry, e.to_string()),
            GatehouseError::Certificate(_) => Reply::error(ErrorCode::Auth, "authentication failed"),
            GatehouseError::Session(e) => Reply::error(ErrorCode::Session, e.to_string()),
            GatehouseError::PolicyViolation(v) => Reply::error(ErrorCode::Policy, v.rule.clone()),
            GatehouseError::Delivery(_) => Reply::error(ErrorCode::Retry, "service temporarily unavailable"),
            GatehouseError::Auth(e) => {
                let code = match e {
                    AuthError::Throttled => ErrorCode::Throttled,
                    AuthError::UserNameTaken => ErrorCode::Taken,
                    AuthError::InvalidResetToken => ErrorCode::Reset,
                    e if e.is_retryable() => ErrorCode::Retry,
                    _ => ErrorCode::Auth,
                };
                Reply::error(code, e.public_message())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::PolicyViolation;
    use crate::auth::session::SessionError;
    use crate::error::StorageError;

    #[test]
    fn parses_commands_case_insensitively() {
        assert_eq!(
            Command::parse("signin alice s3cretpass").unwrap(),
            Command::SignIn {
                user_name: "alice".into(),
                password: "s3cretpass".into()
            }
        );
        assert_eq!(
            Command::parse("SIGNUP bob pw12345678 bob@example.com").unwrap(),
            Command::SignUp {
                user_name: "bob".into(),
                password: "pw12345678".into(),
                email: Some("bob@example.com".into())
            }
        );
        assert_eq!(Command::parse("  whoami \r").unwrap(), Command::WhoAmI);
        assert_eq!(Command::parse("Cert-SignIn").unwrap(), Command::CertSignIn);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(Command::parse("DELETE x"), Err(ParseError::Unknown("DELETE".into())));
        assert!(matches!(Command::parse("SIGNIN alice"), Err(ParseError::Usage(_))));
        assert!(matches!(Command::parse("QUIT now"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn renders_replies() {
        let expires_at = DateTime::parse_from_rfc3339("2030-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            Reply::Session {
                token: "tok".into(),
                expires_at
            }
            .to_string(),
            "OK SESSION tok 2030-01-02T03:04:05Z"
        );
        assert_eq!(
            Reply::error(ErrorCode::Policy, "must be at least 8 characters long").to_string(),
            "ERR POLICY must be at least 8 characters long"
        );
    }

    #[test]
    fn credential_failures_map_to_one_reply() {
        let wrong = Reply::from(&GatehouseError::from(AuthError::InvalidCredentials));
        let malformed = Reply::from(&GatehouseError::from(AuthError::InvalidUserName));
        let unbound = Reply::from(&GatehouseError::from(AuthError::UnboundCertificate));
        assert_eq!(wrong, malformed);
        assert_eq!(wrong, unbound);
        assert_eq!(wrong.to_string(), "ERR AUTH authentication failed");
    }

    #[test]
    fn maps_error_categories() {
        let reply = Reply::from(&GatehouseError::from(StorageError::new("db down")));
        assert!(matches!(reply, Reply::Err { code: ErrorCode::Retry, .. }));

        let reply = Reply::from(&GatehouseError::from(AuthError::Session(SessionError::Expired)));
        assert_eq!(reply.to_string(), "ERR SESSION session expired");

        let reply = Reply::from(&GatehouseError::from(AuthError::PolicyViolation(
            PolicyViolation::new("must contain a digit"),
        )));
        assert_eq!(reply.to_string(), "ERR POLICY must contain a digit");
    }
}
