//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatehouseConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the server is constructed; there is no reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Inconsistent values fail at startup, never at first request

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AccountConfig, ClientAuthMode, GatehouseConfig, ListenerConfig, NotificationConfig,
    ObservabilityConfig, SessionConfig, ThrottleConfig, TimeoutConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
