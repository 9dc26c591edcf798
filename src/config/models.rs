//! Configuration data structures for the bastion.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! carry defaults so a minimal config only names what differs from them.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8443".to_string()
}

fn default_backends_file() -> PathBuf {
    PathBuf::from("backends.txt")
}

/// Top-level bastion configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BastionConfig {
    /// Address the single TLS socket listens on (`IP:PORT`)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Allow-list of backend identities, one hex SHA-256 per line
    #[serde(default = "default_backends_file")]
    pub backends_file: PathBuf,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backends_file: default_backends_file(),
            tls: TlsConfig::default(),
            backend: BackendSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where the bastion's own certificate comes from.
///
/// Either a static PEM pair or ACME; ACME wins when both are present.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Path to PEM encoded certificate chain (static mode)
    pub cert_path: Option<PathBuf>,
    /// Path to PEM encoded private key (static mode)
    pub key_path: Option<PathBuf>,
    /// Automatic certificate management via TLS-ALPN-01
    pub acme: Option<AcmeSettings>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: Some(PathBuf::from("localhost.pem")),
            key_path: Some(PathBuf::from("localhost-key.pem")),
            acme: None,
        }
    }
}

/// ACME (e.g. Let's Encrypt) certificate management configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AcmeSettings {
    /// Host names to request certificates for
    pub domains: Vec<String>,
    /// Contact email for the ACME account
    pub email: String,
    /// Where issued certificates and account keys are cached
    pub cache_dir: PathBuf,
    /// Use the production directory instead of staging
    #[serde(default)]
    pub production: bool,
}

/// Timing of the backend connection lifecycle.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    /// Bound on the liveness PING sent before a connection is published
    #[serde(with = "humantime_duration")]
    pub probe_timeout: Duration,
    /// How long a superseded connection may keep serving in-flight requests
    #[serde(with = "humantime_duration")]
    pub drain_grace: Duration,
    /// Interval between keepalive PINGs on a registered connection
    #[serde(with = "humantime_duration")]
    pub keepalive_interval: Duration,
    /// Bound on each keepalive PING before the session is dropped
    #[serde(with = "humantime_duration")]
    pub keepalive_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Serde adapter for durations written as humantime strings ("5s", "1m").
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map_err(|e| D::Error::custom(format!("invalid duration {raw:?}: {e}")))
    }
}
