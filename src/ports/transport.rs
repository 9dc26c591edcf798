use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http::{Request, Response, StatusCode};
use thiserror::Error;

use crate::core::identity::IdentityHash;

/// Errors surfaced while dispatching a public request to a backend
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// The identity segment is missing, not hex, or the wrong length
    #[error("Invalid backend identity: {0}")]
    InvalidIdentity(String),

    /// No backend with this identity is currently connected
    #[error("Backend {0} unavailable")]
    BackendUnavailable(IdentityHash),

    /// The backend connection failed while carrying the request
    #[error("Transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    /// HTTP status reported to the public client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            DispatchError::BackendUnavailable(_) | DispatchError::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// Result type alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// RoundTrip defines the port (interface) used by the HTTP front to send a
/// rewritten request to whichever backend it names
#[async_trait]
pub trait RoundTrip: Send + Sync + 'static {
    /// Send a rewritten request and return the backend's response
    ///
    /// # Arguments
    /// * `req` - The request, carrying a [`BackendTarget`](crate::core::BackendTarget) extension
    ///
    /// # Returns
    /// The backend's response with its body streamed, or a dispatch error
    async fn round_trip(&self, req: Request<AxumBody>) -> DispatchResult<Response<AxumBody>>;
}
