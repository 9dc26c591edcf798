//! Lifecycle of an authenticated backend connection: probe, publish, keep
//! alive, deregister.
use std::sync::Arc;

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{Instant, MissedTickBehavior},
};

use crate::{
    adapters::upstream::{BackendConnection, UpstreamError},
    config::models::BackendSettings,
    core::{identity::IdentityHash, registry::ConnectionRegistry},
};

/// Why a backend connection was never published
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AcceptError {
    #[error("HTTP/2 handshake with backend {identity} failed: {source}")]
    Handshake {
        identity: IdentityHash,
        #[source]
        source: UpstreamError,
    },

    #[error("Backend {identity} failed its liveness probe: {source}")]
    LivenessProbeFailure {
        identity: IdentityHash,
        #[source]
        source: UpstreamError,
    },
}

/// Promotes verified backend sockets into registered HTTP/2 sessions.
#[derive(Clone)]
pub struct BackendAcceptor {
    registry: Arc<ConnectionRegistry<BackendConnection>>,
    settings: BackendSettings,
}

impl BackendAcceptor {
    pub fn new(
        registry: Arc<ConnectionRegistry<BackendConnection>>,
        settings: BackendSettings,
    ) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<BackendConnection>> {
        &self.registry
    }

    /// Serve a backend that completed the TLS handshake as `identity`.
    ///
    /// Returns once the connection has ended and been deregistered, or with
    /// an error if it never became usable (nothing is published then).
    pub async fn accept<T>(&self, io: T, identity: IdentityHash) -> Result<(), AcceptError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = BackendConnection::handshake(io, identity)
            .await
            .map_err(|source| AcceptError::Handshake { identity, source })?;
        self.serve(Arc::new(conn)).await
    }

    /// Probe `conn`, publish it, and hold the registration until it closes.
    pub async fn serve(&self, conn: Arc<BackendConnection>) -> Result<(), AcceptError> {
        let identity = conn.identity();

        if let Err(source) = conn.ping(self.settings.probe_timeout).await {
            tracing::warn!(backend = %identity, error = %source, "Backend failed liveness probe");
            conn.close();
            return Err(AcceptError::LivenessProbeFailure { identity, source });
        }

        if let Some(previous) = self.registry.publish(identity, conn.clone()) {
            if previous.is_closed() {
                tracing::debug!(backend = %identity, conn = previous.id(), "Replaced connection was already closed");
            } else {
                tracing::info!(
                    backend = %identity,
                    conn = previous.id(),
                    "Draining superseded backend connection"
                );
                let grace = self.settings.drain_grace;
                tokio::spawn(async move { previous.drain(grace).await });
            }
        }
        tracing::info!(backend = %identity, conn = conn.id(), "Accepted new backend connection");

        self.keep_alive(&conn).await;

        if self.registry.remove(&identity, &conn) {
            tracing::info!(backend = %identity, conn = conn.id(), "Backend connection expired");
        } else {
            tracing::debug!(backend = %identity, conn = conn.id(), "Superseded backend connection closed");
        }
        Ok(())
    }

    /// PING the backend periodically until the session ends.
    async fn keep_alive(&self, conn: &BackendConnection) {
        let period = self.settings.keepalive_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = conn.closed() => return,
                _ = ticker.tick() => {
                    match conn.ping(self.settings.keepalive_timeout).await {
                        Ok(rtt) => tracing::trace!(backend = %conn.identity(), rtt = ?rtt, "Keepalive acknowledged"),
                        Err(e) => {
                            tracing::warn!(backend = %conn.identity(), error = %e, "Keepalive failed, closing backend connection");
                            conn.close();
                            conn.closed().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::{sync::oneshot, time::timeout};

    use super::*;
    use crate::adapters::upstream::tests::spawn_echo_backend;

    /// Poll `cond` until it holds or `limit` elapses.
    pub(crate) async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    fn identity() -> IdentityHash {
        IdentityHash::of_public_key(b"backend key")
    }

    fn acceptor(settings: BackendSettings) -> BackendAcceptor {
        BackendAcceptor::new(Arc::new(ConnectionRegistry::new()), settings)
    }

    #[tokio::test]
    async fn test_accept_publishes_then_deregisters_on_close() {
        let acceptor = acceptor(BackendSettings::default());
        let registry = acceptor.registry().clone();

        let (bastion_io, backend_io) = tokio::io::duplex(64 * 1024);
        let backend = spawn_echo_backend(backend_io, "a");
        let session = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept(bastion_io, identity()).await })
        };

        assert!(wait_until(Duration::from_secs(5), || registry.lookup(&identity()).is_some()).await);

        backend.abort();
        let result = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_never_publishes() {
        let acceptor = acceptor(BackendSettings {
            probe_timeout: Duration::from_millis(100),
            ..BackendSettings::default()
        });

        // The peer never answers the HTTP/2 preface or PING.
        let (bastion_io, _silent) = tokio::io::duplex(64 * 1024);
        let result = acceptor.accept(bastion_io, identity()).await;

        assert!(matches!(
            result,
            Err(AcceptError::LivenessProbeFailure { .. })
        ));
        assert!(acceptor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_and_drains_previous() {
        let acceptor = acceptor(BackendSettings {
            drain_grace: Duration::from_secs(1),
            ..BackendSettings::default()
        });
        let registry = acceptor.registry().clone();

        let (first_io, first_backend_io) = tokio::io::duplex(64 * 1024);
        let _first_backend = spawn_echo_backend(first_backend_io, "first");
        let first_session = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept(first_io, identity()).await })
        };
        assert!(wait_until(Duration::from_secs(5), || registry.len() == 1).await);
        let first = registry.lookup(&identity()).unwrap();

        let (second_io, second_backend_io) = tokio::io::duplex(64 * 1024);
        let _second_backend = spawn_echo_backend(second_backend_io, "second");
        let _second_session = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept(second_io, identity()).await })
        };
        assert!(
            wait_until(Duration::from_secs(5), || !registry.is_current(&identity(), &first)).await
        );

        // The first session drains, closes, and must not remove its successor.
        timeout(Duration::from_secs(5), first.closed()).await.unwrap();
        timeout(Duration::from_secs(5), first_session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(registry.len(), 1);

        let current = registry.lookup(&identity()).unwrap();
        assert!(!Arc::ptr_eq(&current, &first));
        assert!(!current.is_closed());
    }

    #[tokio::test]
    async fn test_keepalive_failure_closes_and_deregisters() {
        let acceptor = acceptor(BackendSettings {
            keepalive_interval: Duration::from_millis(50),
            keepalive_timeout: Duration::from_millis(100),
            ..BackendSettings::default()
        });
        let registry = acceptor.registry().clone();

        let (bastion_io, backend_io) = tokio::io::duplex(64 * 1024);
        let (freeze_tx, freeze_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut server = h2::server::handshake(backend_io).await.unwrap();
            tokio::select! {
                _ = async { while server.accept().await.is_some() {} } => {}
                _ = freeze_rx => {}
            }
            // Keep the socket open but stop answering PINGs.
            let _held = server;
            std::future::pending::<()>().await;
        });

        let session = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept(bastion_io, identity()).await })
        };
        assert!(wait_until(Duration::from_secs(5), || registry.len() == 1).await);

        freeze_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(registry.is_empty());
    }
}
