//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gatehouse.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gatehouse.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatehouseConfig {
    /// Service name, used for worker naming and log context.
    pub service_name: String,

    /// URL prefix of the embedding application. Carried for completeness,
    /// the engine never routes on it.
    pub url_prefix: String,

    /// Listener configuration (bind address, connection limits).
    pub listener: ListenerConfig,

    /// Per-connection timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Optional TLS configuration. Plain TCP when absent.
    pub tls: Option<TlsConfig>,

    /// Session issuing and cookie policy.
    pub session: SessionConfig,

    /// Account naming and password rules.
    pub accounts: AccountConfig,

    /// Sign-in throttling.
    pub throttle: ThrottleConfig,

    /// Lifecycle notifications.
    pub notifications: NotificationConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        Self {
            service_name: "gatehouse".to_string(),
            url_prefix: String::new(),
            listener: ListenerConfig::default(),
            timeouts: TimeoutConfig::default(),
            tls: None,
            // Plain TCP cannot carry Secure cookies.
            session: SessionConfig {
                secure_cookies: false,
                ..SessionConfig::default()
            },
            accounts: AccountConfig::default(),
            throttle: ThrottleConfig::default(),
            notifications: NotificationConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Maximum concurrent connections. Connections beyond this are rejected.
    pub max_connections: usize,

    /// Run connection workers in the background scheduling class.
    pub background_workers: bool,

    /// How long `stop` waits for live connections before force-releasing them.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            max_connections: 4096,
            background_workers: false,
            drain_timeout_secs: 10,
        }
    }
}

impl ListenerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Timeout configuration for live connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle timeout: no bytes read or written for this long closes the connection.
    pub idle_secs: u64,

    /// Optional hard cap on total connection lifetime.
    pub max_lifetime_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            max_lifetime_secs: None,
        }
    }
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }
}

/// Whether peers must present a client certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// No client certificate is requested.
    #[default]
    Disabled,
    /// A certificate is requested; anonymous peers are still admitted.
    Optional,
    /// The handshake is rejected without a valid client certificate.
    Required,
}

impl ClientAuthMode {
    pub fn requests_certificate(&self) -> bool {
        !matches!(self, ClientAuthMode::Disabled)
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// CA bundle used to verify client certificates (PEM).
    #[serde(default)]
    pub client_ca_path: Option<String>,

    /// Allowed protocol versions ("1.2", "1.3").
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,

    /// Client certificate requirement.
    #[serde(default)]
    pub client_auth: ClientAuthMode,
}

fn default_protocols() -> Vec<String> {
    vec!["1.2".to_string(), "1.3".to_string()]
}

/// Session issuing and cookie policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie name used when rendering `Set-Cookie`.
    pub cookie_name: String,

    /// Mark cookies `Secure` and refuse to issue over plain transports.
    pub secure_cookies: bool,

    /// Sign-in session lifetime in seconds.
    pub lifetime_secs: u64,

    /// Extend `expires_at` on every successful validation.
    pub sliding_renewal: bool,

    /// Interval of the expired-session sweep in seconds.
    pub cleanup_interval_secs: u64,

    /// Lifetime of password reset tokens in seconds.
    pub reset_token_lifetime_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "gatehouse_session".to_string(),
            secure_cookies: true,
            lifetime_secs: 24 * 60 * 60,
            sliding_renewal: false,
            cleanup_interval_secs: 15 * 60,
            reset_token_lifetime_secs: 60 * 60,
        }
    }
}

/// Account naming and password rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Realm assigned to user names that do not carry one.
    pub default_realm: String,

    pub min_username_length: usize,
    pub max_username_length: usize,
    pub min_realm_length: usize,
    pub max_realm_length: usize,

    /// Minimum password length enforced by the default password policy.
    pub min_password_length: usize,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            default_realm: "default".to_string(),
            min_username_length: 3,
            max_username_length: 64,
            min_realm_length: 1,
            max_realm_length: 64,
            min_password_length: 8,
        }
    }
}

/// Sign-in throttling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Enable per-user-name sign-in throttling.
    pub enabled: bool,

    /// Sustained sign-in attempts allowed per minute.
    pub attempts_per_minute: u32,

    /// Burst capacity.
    pub burst: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            attempts_per_minute: 10,
            burst: 5,
        }
    }
}

/// Lifecycle notification configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Enable notification dispatch.
    pub enabled: bool,

    /// Pending notifications buffered before new ones are dropped.
    pub queue_capacity: usize,

    /// Administrative e-mail recipients.
    pub admin_email: Vec<String>,

    /// Administrative SMS recipients.
    pub admin_sms: Vec<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 256,
            admin_email: Vec::new(),
            admin_sms: Vec::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
