//! Bastion - a TLS relay that lets un-addressable backends serve public HTTP.
//!
//! Backends behind NAT or a firewall dial *out* to the bastion over TLS,
//! present a self-signed Ed25519 certificate, and are registered under the
//! SHA-256 hash of their public key. Public clients reach a backend at
//! `https://<bastion>/<hex hash>/<path>`; the bastion forwards each request
//! as a stream on the backend's own HTTP/2 connection, with the bastion
//! playing the HTTP/2 *client* role on a socket the backend opened.
//!
//! # Features
//! - One listening socket for public HTTPS and backend control connections,
//!   told apart by ALPN (`bastion/0`) before the TLS config is chosen
//! - Mutual TLS 1.3 for backends with an Ed25519-only, allow-listed identity
//! - Liveness probe before a backend is published, periodic keepalive PINGs
//! - Atomic replacement on reconnect; the superseded connection drains
//! - Static certificates or ACME (TLS-ALPN-01) via `rustls-acme`
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use bastion::{BastionServer, utils::GracefulShutdown};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = bastion::config::load_config("bastion.toml")?;
//! let server = Arc::new(BastionServer::from_config(&cfg)?);
//! let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
//! let shutdown = GracefulShutdown::new();
//! server.serve(listener, shutdown.token()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping the identity, registry and routing rules inside `core`.
//!
//! # Error Handling
//! Each seam has its own `thiserror` enum; application plumbing returns
//! `eyre::Result<T>` with context attached through `WrapErr`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{BackendConnection, BastionServer, CertificateSource, HttpHandler},
    core::{AllowedSet, ConnectionRegistry, IdentityHash},
    ports::RoundTrip,
    utils::GracefulShutdown,
};
