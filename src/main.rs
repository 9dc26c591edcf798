use std::{path::Path, sync::Arc};

use bastion::{
    BastionServer, IdentityHash,
    config::{BastionConfig, BastionConfigValidator, loader::DEFAULT_CONFIG_TOML, load_config},
    tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "bastion.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "bastion.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "bastion.toml")]
        config: String,
    },
    /// Start the bastion (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "bastion.toml")]
        config: String,
    },
    /// Print the backend identity hash of an Ed25519 certificate
    Identity {
        /// PEM file containing the backend certificate
        cert: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config),
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Identity { cert }) => identity_command(&cert),
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await, // Default to serve with config from args
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    let config: BastionConfig = load_config(config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was already installed; continuing with it.",
            e
        );
    }

    BastionConfigValidator::validate(&config).map_err(|e| eyre!("{}", e))?;

    let server = Arc::new(BastionServer::from_config(&config).context("Failed to start bastion")?);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    let graceful_shutdown = GracefulShutdown::new();
    let signal_handler = {
        let graceful_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = graceful_shutdown.run_signal_handler().await {
                tracing::error!("Signal handler failed: {:?}", e);
            }
        })
    };

    let serve = tokio::spawn(server.clone().serve(listener, graceful_shutdown.token()));

    let reason = graceful_shutdown.wait_for_shutdown_signal().await;
    tracing::info!(
        "Shutdown signal received: {:?}; {} backend(s) were connected",
        reason,
        server.registry().len()
    );

    serve.await.context("Accept loop panicked")??;
    signal_handler.abort();

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = BastionConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    match bastion::AllowedSet::load(&config.backends_file) {
        Ok(allowed) => {
            println!("✅ Backends file: {} identities", allowed.len());
        }
        Err(e) => {
            eprintln!("❌ Backends file invalid:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    }

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Backends File: {}", config.backends_file.display());
    println!("   • ACME: {}", config.tls.acme.is_some());
    println!(
        "   • Probe / Drain / Keepalive: {:?} / {:?} / {:?}",
        config.backend.probe_timeout, config.backend.drain_grace, config.backend.keepalive_interval
    );
    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG_TOML)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'bastion serve --config {config_path}' to start the server");
    Ok(())
}

/// Print the identity hash of a backend certificate for the allow-list
fn identity_command(cert_path: &str) -> Result<()> {
    let pem = std::fs::read(cert_path).with_context(|| format!("Failed to read {cert_path}"))?;
    let cert = rustls_pemfile::certs(&mut &pem[..])
        .next()
        .ok_or_else(|| eyre!("No certificate found in {cert_path}"))?
        .with_context(|| format!("Failed to parse {cert_path}"))?;
    let identity = IdentityHash::from_certificate(cert.as_ref())?;
    println!("{identity}");
    Ok(())
}
