//! The single TLS socket shared by public clients and backends.
//!
//! Each accepted connection is classified from the ALPN list in its
//! ClientHello before any TLS config is chosen: `bastion/0` selects the
//! backend config (mutual TLS, identity check), `acme-tls/1` the ACME
//! challenge config, and everything else the public HTTPS config.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, extract::ConnectInfo};
use eyre::{Context, Result, eyre};
use hyper::{Request, body::Incoming};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use rustls::server::Acceptor;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::Instrument;

use crate::{
    adapters::{
        acceptor::BackendAcceptor,
        dispatcher::RequestDispatcher,
        http_handler::HttpHandler,
        tls::{ACME_TLS_ALPN, BACKEND_ALPN, CertificateSource, TlsConfigs, crypto_provider},
        upstream::BackendConnection,
    },
    config::models::{BackendSettings, BastionConfig},
    core::{
        identity::{AllowedSet, IdentityHash},
        registry::ConnectionRegistry,
    },
    tracing_setup::create_connection_span,
};

/// Bound on reading the ClientHello and completing the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What an incoming connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Backend,
    AcmeChallenge,
    Public,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Backend => "backend",
            ConnectionKind::AcmeChallenge => "acme",
            ConnectionKind::Public => "public",
        }
    }
}

/// Classify a connection from the ALPN protocols offered in its ClientHello.
pub fn classify<'a>(alpn: Option<impl Iterator<Item = &'a [u8]>>) -> ConnectionKind {
    let Some(protocols) = alpn else {
        return ConnectionKind::Public;
    };
    let mut kind = ConnectionKind::Public;
    for protocol in protocols {
        if protocol == BACKEND_ALPN {
            return ConnectionKind::Backend;
        }
        if protocol == ACME_TLS_ALPN {
            kind = ConnectionKind::AcmeChallenge;
        }
    }
    kind
}

/// The bastion: registry, TLS configs and public router.
pub struct BastionServer {
    registry: Arc<ConnectionRegistry<BackendConnection>>,
    tls: TlsConfigs,
    acceptor: BackendAcceptor,
    router: Router,
}

impl BastionServer {
    pub fn new(
        allowed: Arc<AllowedSet>,
        certificates: CertificateSource,
        settings: BackendSettings,
    ) -> Result<Self> {
        let tls = TlsConfigs::new(certificates, allowed, crypto_provider())?;
        let registry = Arc::new(ConnectionRegistry::new());
        let acceptor = BackendAcceptor::new(registry.clone(), settings);
        let dispatcher = Arc::new(RequestDispatcher::new(registry.clone()));
        let router = HttpHandler::new(dispatcher).router();

        Ok(Self {
            registry,
            tls,
            acceptor,
            router,
        })
    }

    /// Build the server described by a loaded configuration.
    pub fn from_config(config: &BastionConfig) -> Result<Self> {
        let allowed = AllowedSet::load(&config.backends_file)?;
        tracing::info!(
            "Loaded {} allowed backend(s) from {}",
            allowed.len(),
            config.backends_file.display()
        );
        let certificates = CertificateSource::from_config(&config.tls, &crypto_provider())?;
        Self::new(Arc::new(allowed), certificates, config.backend.clone())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<BackendConnection>> {
        &self.registry
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        tracing::info!("Bastion listening on {}", local_addr);

        loop {
            let (tcp, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Stopped accepting connections on {}", local_addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            let shutdown = shutdown.child_token();
            tokio::spawn(
                async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        result = server.handle_connection(tcp, peer) => {
                            if let Err(e) = result {
                                tracing::debug!("Connection from {} ended: {:#}", peer, e);
                            }
                        }
                    }
                }
                .instrument(create_connection_span(peer)),
            );
        }
    }

    async fn handle_connection(&self, tcp: TcpStream, peer: SocketAddr) -> Result<()> {
        let start = timeout(
            TLS_HANDSHAKE_TIMEOUT,
            LazyConfigAcceptor::new(Acceptor::default(), tcp),
        )
        .await
        .map_err(|_| eyre!("Timed out waiting for ClientHello"))?
        .context("Failed to read ClientHello")?;

        let kind = classify(start.client_hello().alpn());
        tracing::Span::current().record("kind", kind.as_str());

        match kind {
            ConnectionKind::Backend => {
                let tls = timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    start.into_stream(self.tls.backend.clone()),
                )
                .await
                .map_err(|_| eyre!("Backend TLS handshake timed out"))?
                .context("Backend TLS handshake failed")?;

                let leaf = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|chain| chain.first())
                    .ok_or_else(|| eyre!("Backend presented no certificate"))?;
                let identity = IdentityHash::from_certificate(leaf.as_ref())?;
                tracing::Span::current().record("backend", tracing::field::display(identity));

                self.acceptor.accept(tls, identity).await?;
            }
            ConnectionKind::AcmeChallenge => {
                let config = self
                    .tls
                    .acme_challenge
                    .clone()
                    .ok_or_else(|| eyre!("ACME challenge received but ACME is not configured"))?;
                let mut tls = start
                    .into_stream(config)
                    .await
                    .context("ACME challenge handshake failed")?;
                tracing::info!("Completed ACME TLS-ALPN-01 challenge handshake");
                tls.shutdown().await.ok();
            }
            ConnectionKind::Public => {
                let tls = timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    start.into_stream(self.tls.public.clone()),
                )
                .await
                .map_err(|_| eyre!("TLS handshake timed out"))?
                .context("TLS handshake failed")?;

                let router = self.router.clone();
                let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(peer));
                    router.clone().oneshot(req)
                });

                Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await
                    .map_err(|e| eyre!("Public connection error: {}", e))?;
            }
        }
        Ok(())
    }
}
