//! Password quality policy and credential hashing.
//!
//! # Responsibilities
//! - Gate new passwords on account creation and password change
//! - Hash passwords into self-describing PHC strings and verify them
//!
//! # Design Decisions
//! - The policy is never consulted on sign-in, so tightening it cannot
//!   lock out existing accounts
//! - Argon2id with parameters carried in the PHC string; verification
//!   reads them back, so cost changes only affect new hashes

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use thiserror::Error;

/// A candidate password failed the quality gate. The message names the rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("password policy violated: {rule}")]
pub struct PolicyViolation {
    pub rule: String,
}

impl PolicyViolation {
    pub fn new(rule: impl Into<String>) -> Self {
        Self { rule: rule.into() }
    }
}

/// Pluggable password quality predicate.
pub trait PasswordPolicy: Send + Sync {
    fn check(&self, candidate: &str) -> Result<(), PolicyViolation>;
}

impl<F> PasswordPolicy for F
where
    F: Fn(&str) -> Result<(), PolicyViolation> + Send + Sync,
{
    fn check(&self, candidate: &str) -> Result<(), PolicyViolation> {
        self(candidate)
    }
}

/// Default policy: a minimum length in characters.
#[derive(Debug, Clone, Copy)]
pub struct MinLengthPolicy {
    pub min_chars: usize,
}

impl MinLengthPolicy {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl PasswordPolicy for MinLengthPolicy {
    fn check(&self, candidate: &str) -> Result<(), PolicyViolation> {
        if candidate.chars().count() < self.min_chars {
            tracing::debug!(component = "password", min_chars = self.min_chars, "Password too short");
            return Err(PolicyViolation::new(format!(
                "must be at least {} characters long",
                self.min_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum HashError {
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("stored password hash is malformed: {0}")]
    MalformedHash(String),
}

/// Produces and checks stored password hashes.
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// `Ok(false)` on mismatch; `Err` only when the stored hash is unusable.
    fn verify(&self, password: &str, stored_hash: &str) -> Result<bool, HashError>;
}

/// Argon2id hasher.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    /// 64 MiB memory, 3 iterations, 1 lane.
    pub fn new() -> Self {
        Self {
            params: Params::new(64 * 1024, 3, 1, None).unwrap_or_default(),
        }
    }

    /// Custom cost parameters. Falls back to the library defaults if the
    /// combination is invalid.
    pub fn with_cost(memory_kib: u32, iterations: u32, lanes: u32) -> Self {
        Self {
            params: Params::new(memory_kib, iterations, lanes, None).unwrap_or_default(),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError::Hash(e.to_string()))
    }

    fn verify(&self, password: &str, stored_hash: &str) -> Result<bool, HashError> {
        let parsed = PasswordHash::new(stored_hash)
            .map_err(|e| HashError::MalformedHash(e.to_string()))?;

        // The comparison inside verify_password is constant-time.
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Hash(e.to_string())),
        }
    }
}
