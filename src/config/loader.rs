use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::BastionConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: TOML, YAML, JSON, etc.
pub fn load_config(config_path: impl AsRef<Path>) -> Result<BastionConfig> {
    let config_path = config_path.as_ref();

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let bastion_config: BastionConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(bastion_config)
}

/// Commented starting configuration written by `bastion init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# Bastion configuration

# The single TLS socket shared by public clients and backends
listen_addr = "127.0.0.1:8443"

# Allow-list of backend identities: one hex SHA-256 of an Ed25519 public key
# per line. Use `bastion identity <cert.pem>` to compute one.
backends_file = "backends.txt"

[tls]
cert_path = "localhost.pem"
key_path = "localhost-key.pem"

# Obtain certificates from Let's Encrypt instead of the files above
# [tls.acme]
# domains = ["bastion.example.com"]
# email = "ops@example.com"
# cache_dir = "/var/cache/bastion"
# production = true

[backend]
probe_timeout = "5s"
drain_grace = "60s"
keepalive_interval = "15s"
keepalive_timeout = "15s"

[logging]
level = "info"
format = "pretty"
"#;
