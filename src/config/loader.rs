//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::GatehouseConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatehouseConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GatehouseConfig, ConfigError> {
    let config: GatehouseConfig = toml::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ClientAuthMode;
    use std::io::Write;

    #[test]
    fn minimal_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "service_name = \"billing-api\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.service_name, "billing-api");
        assert_eq!(config.listener.max_connections, 4096);
        assert_eq!(config.timeouts.idle_secs, 30);
        assert!(!config.session.sliding_renewal);
        assert!(config.tls.is_none());
    }

    #[test]
    fn parses_tls_section() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:9443"
            max_connections = 2

            [tls]
            cert_path = "server.pem"
            key_path = "server.key"
            client_ca_path = "clients.pem"
            protocols = ["1.3"]
            client_auth = "required"
            "#,
        )
        .unwrap();

        let tls = config.tls.unwrap();
        assert_eq!(tls.client_auth, ClientAuthMode::Required);
        assert_eq!(tls.protocols, vec!["1.3".to_string()]);
        assert_eq!(config.listener.max_connections, 2);
    }

    #[test]
    fn inconsistent_values_fail_fast() {
        let err = parse_config(
            r#"
            [accounts]
            min_username_length = 10
            max_username_length = 4
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Validation(ref errors) if errors.len() == 1));
        assert!(err.to_string().contains("accounts.min_username_length"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
