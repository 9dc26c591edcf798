use std::net::SocketAddr;

use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::{LogFormat, LoggingConfig};

/// Build the level filter; `RUST_LOG` takes precedence over the configured level
fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}")),
    }
}

/// Initialize logging from the `[logging]` section
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = env_filter(&config.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    };
    result.map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        "Bastion logging initialized (level: {}, format: {:?})",
        config.level,
        config.format
    );
    Ok(())
}

/// Span covering one accepted TCP connection, whatever it turns out to be
pub fn create_connection_span(peer: SocketAddr) -> tracing::Span {
    tracing::info_span!(
        "connection",
        peer = %peer,
        kind = tracing::field::Empty,
        backend = tracing::field::Empty,
    )
}
