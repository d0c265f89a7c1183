//! Authentication subsystem.
//!
//! # Data Flow
//! ```text
//! TLS handshake
//!     → certificate.rs (policy check, principal hint)
//!     → principal.rs (credential → UserId; password or certificate binding)
//!         ↳ throttle.rs (optional per-name token bucket)
//!         ↳ password.rs (Argon2id verify)
//!     → session.rs (issue / validate / revoke)
//!
//! Account flows (accounts.rs):
//!     sign-up, password change, reset → password.rs policy
//!                                     → notifications
//! ```
//!
//! # Design Decisions
//! - Only the session manager mutates sessions; only the resolver and the
//!   account service touch the account store
//! - Credential failures share one public message to prevent enumeration

pub mod accounts;
pub mod certificate;
pub mod password;
pub mod principal;
pub mod session;
pub mod throttle;

pub use accounts::AccountService;
pub use certificate::{CertificatePolicy, CertificateValidator, PrincipalHint, TlsIdentity, Verdict};
pub use password::{Argon2Hasher, CredentialHasher, MinLengthPolicy, PasswordPolicy, PolicyViolation};
pub use principal::{
    Account, AccountStore, AuthError, Credential, InMemoryAccountStore, PrincipalResolver, UserId,
};
pub use session::{Session, SessionError, SessionManager, SessionToken, TransportSecurity};
