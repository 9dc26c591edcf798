use std::{net::SocketAddr, time::Duration};

use crate::config::models::{BackendSettings, BastionConfig, TlsConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Bastion configuration validator
pub struct BastionConfigValidator;

impl BastionConfigValidator {
    /// Validate the entire configuration, reporting every problem at once
    pub fn validate(config: &BastionConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.backends_file.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "backends_file".to_string(),
            });
        }

        if let Err(e) = Self::validate_tls_config(&config.tls) {
            errors.push(e);
        }

        errors.extend(Self::validate_backend_settings(&config.backend));

        if config.logging.level.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "logging.level".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8443' or '0.0.0.0:443')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if let Some(acme) = &config.acme {
            if acme.domains.is_empty() || acme.domains.iter().any(|d| d.trim().is_empty()) {
                return Err(ValidationError::InvalidTls {
                    message: "ACME configuration must include at least one non-empty domain"
                        .to_string(),
                });
            }
            if acme.email.trim().is_empty() {
                return Err(ValidationError::InvalidTls {
                    message: "ACME configuration must include a contact email".to_string(),
                });
            }
            if acme.cache_dir.as_os_str().is_empty() {
                return Err(ValidationError::InvalidTls {
                    message: "ACME configuration must include a cache directory".to_string(),
                });
            }
            return Ok(());
        }

        match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(ValidationError::InvalidTls {
                        message: format!("Certificate file does not exist: {}", cert.display()),
                    });
                }
                if !key.exists() {
                    return Err(ValidationError::InvalidTls {
                        message: format!("Private key file does not exist: {}", key.display()),
                    });
                }
                Ok(())
            }
            _ => Err(ValidationError::InvalidTls {
                message: "TLS configuration must specify either certificate and private key paths, or ACME configuration".to_string(),
            }),
        }
    }

    fn validate_backend_settings(settings: &BackendSettings) -> Vec<ValidationError> {
        [
            ("backend.probe_timeout", settings.probe_timeout),
            ("backend.drain_grace", settings.drain_grace),
            ("backend.keepalive_interval", settings.keepalive_interval),
            ("backend.keepalive_timeout", settings.keepalive_timeout),
        ]
        .into_iter()
        .filter(|(_, value)| *value == Duration::ZERO)
        .map(|(field, _)| ValidationError::InvalidField {
            field: field.to_string(),
            message: "Duration must be greater than zero".to_string(),
        })
        .collect()
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut message = format!("Found {} validation error(s):\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
