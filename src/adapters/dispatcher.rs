use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};

use crate::{
    adapters::upstream::BackendConnection,
    core::{registry::ConnectionRegistry, routing::BackendTarget},
    ports::transport::{DispatchError, DispatchResult, RoundTrip},
};

/// Sends rewritten requests over whichever backend connection is currently
/// registered for the identity they name.
pub struct RequestDispatcher {
    registry: Arc<ConnectionRegistry<BackendConnection>>,
}

impl RequestDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry<BackendConnection>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RoundTrip for RequestDispatcher {
    async fn round_trip(&self, req: Request<AxumBody>) -> DispatchResult<Response<AxumBody>> {
        let target = req
            .extensions()
            .get::<BackendTarget>()
            .ok_or_else(|| DispatchError::InvalidIdentity("missing backend target".to_string()))?;
        let identity = target
            .identity()
            .map_err(|e| DispatchError::InvalidIdentity(e.to_string()))?;

        // The connection is resolved once; a concurrent replacement affects
        // only later requests.
        let conn = self
            .registry
            .lookup(&identity)
            .ok_or(DispatchError::BackendUnavailable(identity))?;

        tracing::debug!(
            backend = %identity,
            conn = conn.id(),
            method = %req.method(),
            uri = %req.uri(),
            "Dispatching request to backend"
        );

        conn.send_request(req).await.map_err(|e| {
            tracing::warn!(backend = %identity, conn = conn.id(), error = %e, "Backend request failed");
            DispatchError::Transport(e.to_string())
        })
    }
}
