pub mod acceptor;
pub mod dispatcher;
pub mod http_handler;
pub mod listener;
pub mod tls;
pub mod upstream;

/// Re-export commonly used types from adapters
pub use acceptor::{AcceptError, BackendAcceptor};
pub use dispatcher::RequestDispatcher;
pub use http_handler::HttpHandler;
pub use listener::{BastionServer, ConnectionKind, classify};
pub use tls::{BackendIdentityVerifier, CertificateSource, StaticCertResolver, TlsConfigs};
pub use upstream::{BackendConnection, UpstreamError};
