//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0, addresses parse)
//! - Check cross-field constraints (length bounds, TLS prerequisites)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatehouseConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ClientAuthMode, GatehouseConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid socket address: {value}")]
    BadAddress { field: &'static str, value: String },

    #[error("{min_field} ({min}) exceeds {max_field} ({max})")]
    InvertedBounds {
        min_field: &'static str,
        min: usize,
        max_field: &'static str,
        max: usize,
    },

    #[error("accounts.default_realm length {len} is outside [{min}, {max}]")]
    DefaultRealmOutOfBounds { len: usize, min: usize, max: usize },

    #[error("tls.protocols must not be empty")]
    NoProtocols,

    #[error("tls.protocols contains unknown version {0:?} (expected \"1.2\" or \"1.3\")")]
    UnknownProtocol(String),

    #[error("tls.client_auth = {0:?} requires tls.client_ca_path")]
    MissingClientCa(ClientAuthMode),

    #[error("timeouts.max_lifetime_secs ({max}) is shorter than timeouts.idle_secs ({idle})")]
    LifetimeShorterThanIdle { max: u64, idle: u64 },

    #[error("session.secure_cookies requires a [tls] section; no session could be issued over plain TCP")]
    SecureCookiesWithoutTls,
}

/// Validate a configuration, collecting every violation.
pub fn validate_config(config: &GatehouseConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_connections" });
    }

    if config.timeouts.idle_secs == 0 {
        errors.push(ValidationError::Zero { field: "timeouts.idle_secs" });
    }
    if let Some(max) = config.timeouts.max_lifetime_secs {
        if max < config.timeouts.idle_secs {
            errors.push(ValidationError::LifetimeShorterThanIdle {
                max,
                idle: config.timeouts.idle_secs,
            });
        }
    }

    if config.session.lifetime_secs == 0 {
        errors.push(ValidationError::Zero { field: "session.lifetime_secs" });
    }
    if config.session.secure_cookies && config.tls.is_none() {
        errors.push(ValidationError::SecureCookiesWithoutTls);
    }
    if config.session.cleanup_interval_secs == 0 {
        errors.push(ValidationError::Zero { field: "session.cleanup_interval_secs" });
    }
    if config.session.reset_token_lifetime_secs == 0 {
        errors.push(ValidationError::Zero { field: "session.reset_token_lifetime_secs" });
    }

    let accounts = &config.accounts;
    if accounts.min_username_length == 0 {
        errors.push(ValidationError::Zero { field: "accounts.min_username_length" });
    }
    if accounts.min_username_length > accounts.max_username_length {
        errors.push(ValidationError::InvertedBounds {
            min_field: "accounts.min_username_length",
            min: accounts.min_username_length,
            max_field: "accounts.max_username_length",
            max: accounts.max_username_length,
        });
    }
    if accounts.min_realm_length > accounts.max_realm_length {
        errors.push(ValidationError::InvertedBounds {
            min_field: "accounts.min_realm_length",
            min: accounts.min_realm_length,
            max_field: "accounts.max_realm_length",
            max: accounts.max_realm_length,
        });
    }
    let realm_len = accounts.default_realm.chars().count();
    if realm_len < accounts.min_realm_length || realm_len > accounts.max_realm_length {
        errors.push(ValidationError::DefaultRealmOutOfBounds {
            len: realm_len,
            min: accounts.min_realm_length,
            max: accounts.max_realm_length,
        });
    }
    if accounts.min_password_length == 0 {
        errors.push(ValidationError::Zero { field: "accounts.min_password_length" });
    }

    if config.throttle.enabled {
        if config.throttle.attempts_per_minute == 0 {
            errors.push(ValidationError::Zero { field: "throttle.attempts_per_minute" });
        }
        if config.throttle.burst == 0 {
            errors.push(ValidationError::Zero { field: "throttle.burst" });
        }
    }

    if config.notifications.enabled && config.notifications.queue_capacity == 0 {
        errors.push(ValidationError::Zero { field: "notifications.queue_capacity" });
    }

    if let Some(tls) = &config.tls {
        if tls.protocols.is_empty() {
            errors.push(ValidationError::NoProtocols);
        }
        for protocol in &tls.protocols {
            if protocol != "1.2" && protocol != "1.3" {
                errors.push(ValidationError::UnknownProtocol(protocol.clone()));
            }
        }
        if tls.client_auth.requests_certificate() && tls.client_ca_path.is_none() {
            errors.push(ValidationError::MissingClientCa(tls.client_auth));
        }
    }

    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BadAddress {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&GatehouseConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_violation() {
        let mut config = GatehouseConfig::default();
        config.listener.max_connections = 0;
        config.timeouts.idle_secs = 0;
        config.listener.bind_address = "not-an-address".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::Zero { field: "listener.max_connections" }));
        assert!(errors.contains(&ValidationError::Zero { field: "timeouts.idle_secs" }));
    }

    #[test]
    fn username_bounds_must_not_invert() {
        let mut config = GatehouseConfig::default();
        config.accounts.min_username_length = 80;
        config.accounts.max_username_length = 64;

        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(
            errors[0],
            ValidationError::InvertedBounds { min: 80, max: 64, .. }
        ));
    }

    #[test]
    fn default_realm_must_fit_realm_bounds() {
        let mut config = GatehouseConfig::default();
        config.accounts.max_realm_length = 3;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DefaultRealmOutOfBounds { len: 7, min: 1, max: 3 }]
        );
    }

    #[test]
    fn mutual_tls_requires_client_ca() {
        let mut config = GatehouseConfig::default();
        config.tls = Some(TlsConfig {
            cert_path: "server.pem".into(),
            key_path: "server.key".into(),
            client_ca_path: None,
            protocols: vec!["1.3".into(), "1.1".into()],
            client_auth: ClientAuthMode::Required,
        });

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::UnknownProtocol("1.1".into())));
        assert!(errors.contains(&ValidationError::MissingClientCa(ClientAuthMode::Required)));
    }

    #[test]
    fn max_lifetime_not_shorter_than_idle() {
        let mut config = GatehouseConfig::default();
        config.timeouts.max_lifetime_secs = Some(5);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::LifetimeShorterThanIdle { max: 5, idle: 30 }]
        );
    }

    #[test]
    fn secure_cookies_need_tls() {
        let mut config = GatehouseConfig::default();
        config.session.secure_cookies = true;
        assert_eq!(
            validate_config(&config).unwrap_err(),
            vec![ValidationError::SecureCookiesWithoutTls]
        );

        config.tls = Some(TlsConfig {
            cert_path: "server.pem".into(),
            key_path: "server.key".into(),
            client_ca_path: None,
            protocols: vec!["1.3".into()],
            client_auth: ClientAuthMode::Disabled,
        });
        assert_eq!(validate_config(&config), Ok(()));
    }
}
