//! HTTP/2 client sessions over connections that backends dialed in.
//!
//! The backend is the TLS client but the HTTP/2 *server*: once the handshake
//! completes the bastion speaks the client side of HTTP/2 on the accepted
//! socket and sends public requests upstream as ordinary streams.
//!
//! A [`BackendConnection`] owns the socket through a spawned driver task. The
//! driver cancels a token when the session ends for any reason (peer close,
//! protocol error, abort), which is what [`BackendConnection::closed`] waits on.
use std::{
    future::poll_fn,
    pin::Pin,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
    time::{Duration, Instant},
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use h2::{Ping, PingPong, RecvStream, SendStream, client::SendRequest};
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyExt;
use http::{Request, Response, Version};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::core::identity::IdentityHash;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors raised by a backend HTTP/2 session
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(#[source] h2::Error),

    #[error("Backend did not answer PING within {0:?}")]
    PingTimeout(Duration),

    #[error("PING failed: {0}")]
    Ping(#[source] h2::Error),

    #[error("Connection is draining and accepts no new requests")]
    Draining,

    #[error("Request failed: {0}")]
    Request(#[source] h2::Error),
}

/// One authenticated, live, multiplexed session with a backend.
pub struct BackendConnection {
    id: u64,
    identity: IdentityHash,
    registered_at: DateTime<Utc>,
    sender: Mutex<Option<SendRequest<Bytes>>>,
    ping_pong: tokio::sync::Mutex<PingPong>,
    closed: CancellationToken,
    driver: JoinHandle<()>,
}

impl BackendConnection {
    /// Take the client role of an HTTP/2 session on `io` and start driving it.
    pub async fn handshake<T>(io: T, identity: IdentityHash) -> Result<Self, UpstreamError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let (sender, mut connection) = h2::client::Builder::new()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(UpstreamError::Handshake)?;
        // The first call on a fresh connection always yields the handle.
        let ping_pong = connection
            .ping_pong()
            .ok_or(UpstreamError::Draining)?;

        let closed = CancellationToken::new();
        let guard = closed.clone().drop_guard();
        let driver = tokio::spawn(async move {
            // Cancels `closed` on completion and on abort.
            let _guard = guard;
            match connection.await {
                Ok(()) => tracing::debug!(backend = %identity, conn = id, "HTTP/2 session ended"),
                Err(e) => {
                    tracing::debug!(backend = %identity, conn = id, error = %e, "HTTP/2 session failed")
                }
            }
        });

        Ok(Self {
            id,
            identity,
            registered_at: Utc::now(),
            sender: Mutex::new(Some(sender)),
            ping_pong: tokio::sync::Mutex::new(ping_pong),
            closed,
            driver,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> IdentityHash {
        self.identity
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Send an HTTP/2 PING and wait for its acknowledgement, returning the round-trip time.
    pub async fn ping(&self, limit: Duration) -> Result<Duration, UpstreamError> {
        let mut ping_pong = self.ping_pong.lock().await;
        let started = Instant::now();
        match timeout(limit, ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_pong)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(UpstreamError::Ping(e)),
            Err(_) => Err(UpstreamError::PingTimeout(limit)),
        }
    }

    /// Send `req` as a new stream and return the response with its body streamed.
    pub async fn send_request(
        &self,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, UpstreamError> {
        let sender = self.sender_slot().clone().ok_or(UpstreamError::Draining)?;

        let (mut parts, body) = req.into_parts();
        let inbound_version = parts.version;
        parts.version = Version::HTTP_2;
        let end_of_stream = body.is_end_stream();

        let (response, send_stream) = {
            let mut sender = sender.ready().await.map_err(UpstreamError::Request)?;
            sender
                .send_request(Request::from_parts(parts, ()), end_of_stream)
                .map_err(UpstreamError::Request)?
        };

        if !end_of_stream {
            let identity = self.identity;
            tokio::spawn(async move {
                if let Err(e) = pump_request_body(body, send_stream).await {
                    tracing::debug!(backend = %identity, error = %e, "Request body forwarding stopped");
                }
            });
        }

        let response = response.await.map_err(UpstreamError::Request)?;
        let (mut parts, recv) = response.into_parts();
        // Answer in the public client's protocol version, not the tunnel's.
        parts.version = inbound_version;
        Ok(Response::from_parts(parts, AxumBody::new(RecvBody::new(recv))))
    }

    /// Stop accepting requests and let in-flight streams finish, closing the
    /// session outright once `grace` elapses.
    pub async fn drain(&self, grace: Duration) {
        // With the last SendRequest gone, h2 closes the session as soon as
        // no streams remain open.
        self.sender_slot().take();
        if timeout(grace, self.closed()).await.is_err() {
            tracing::warn!(
                backend = %self.identity,
                conn = self.id,
                "Drain grace of {:?} elapsed, closing connection",
                grace
            );
            self.close();
        }
    }

    /// Tear the session down immediately.
    pub fn close(&self) {
        self.sender_slot().take();
        self.driver.abort();
    }

    fn sender_slot(&self) -> std::sync::MutexGuard<'_, Option<SendRequest<Bytes>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("registered_at", &self.registered_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Copy a request body onto an HTTP/2 stream, honouring flow control.
async fn pump_request_body(
    mut body: AxumBody,
    mut stream: SendStream<Bytes>,
) -> Result<(), h2::Error> {
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Inbound request body failed: {}", e);
                stream.send_reset(h2::Reason::CANCEL);
                return Ok(());
            }
        };

        match frame.into_data() {
            Ok(mut data) => {
                while !data.is_empty() {
                    stream.reserve_capacity(data.len());
                    let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                        Some(granted) => granted?,
                        None => return Ok(()),
                    };
                    if granted == 0 {
                        continue;
                    }
                    let chunk = data.split_to(granted.min(data.len()));
                    stream.send_data(chunk, false)?;
                }
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    return stream.send_trailers(trailers);
                }
            }
        }
    }

    stream.send_data(Bytes::new(), true)
}

/// Response body read from an HTTP/2 stream, releasing flow-control
/// capacity as data is consumed.
struct RecvBody {
    recv: RecvStream,
    data_done: bool,
}

impl RecvBody {
    fn new(recv: RecvStream) -> Self {
        Self {
            recv,
            data_done: false,
        }
    }
}

impl HttpBody for RecvBody {
    type Data = Bytes;
    type Error = h2::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if !this.data_done {
            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => this.data_done = true,
            }
        }

        match ready!(this.recv.poll_trailers(cx)) {
            Ok(Some(trailers)) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
            Ok(None) => Poll::Ready(None),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.recv.is_end_stream()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::convert::Infallible;

    use http_body_util::{BodyExt, Full};
    use hyper::{body::Incoming, server::conn::http2, service::service_fn};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use tokio::io::DuplexStream;

    use super::*;

    /// Serve HTTP/2 on `io` the way a backend would, echoing the path, query
    /// and request body back as `<tag> <path>?<query> <body>`.
    pub(crate) fn spawn_echo_backend(io: DuplexStream, tag: &'static str) -> JoinHandle<()> {
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| async move {
                let path = req.uri().path().to_string();
                let query = req.uri().query().unwrap_or("").to_string();
                let forwarded_for = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let authority = req
                    .uri()
                    .authority()
                    .map(|a| a.to_string())
                    .unwrap_or_default();
                let body = req.into_body().collect().await.map(|b| b.to_bytes());
                let body = String::from_utf8_lossy(&body.unwrap_or_default()).to_string();
                let response = Response::builder()
                    .status(200)
                    .header("x-backend", tag)
                    .header("x-seen-authority", authority)
                    .header("x-seen-forwarded-for", forwarded_for)
                    .body(Full::new(Bytes::from(format!("{tag} {path}?{query} {body}"))))
                    .unwrap();
                Ok::<_, Infallible>(response)
            });
            let _ = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(io), service)
                .await;
        })
    }

    pub(crate) async fn connected_pair(tag: &'static str) -> (BackendConnection, JoinHandle<()>) {
        let (bastion_io, backend_io) = tokio::io::duplex(64 * 1024);
        let backend = spawn_echo_backend(backend_io, tag);
        let conn = BackendConnection::handshake(bastion_io, IdentityHash::of_public_key(b"b"))
            .await
            .unwrap();
        (conn, backend)
    }

    /// Serve HTTP/2 on `io`, answering every request with `slow ok` after `delay`.
    fn spawn_slow_backend(io: DuplexStream, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<Incoming>| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"slow ok"))))
            });
            let _ = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(io), service)
                .await;
        })
    }

    async fn slow_pair(delay: Duration) -> (BackendConnection, JoinHandle<()>) {
        let (bastion_io, backend_io) = tokio::io::duplex(64 * 1024);
        let backend = spawn_slow_backend(backend_io, delay);
        let conn = BackendConnection::handshake(bastion_io, IdentityHash::of_public_key(b"b"))
            .await
            .unwrap();
        (conn, backend)
    }

    async fn fetch(conn: &BackendConnection, uri: &str) -> Result<String, String> {
        let response = conn.send_request(get(uri)).await.map_err(|e| e.to_string())?;
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?
            .to_bytes();
        Ok(String::from_utf8_lossy(&body).to_string())
    }

    fn get(uri: &str) -> Request<AxumBody> {
        Request::builder().uri(uri).body(AxumBody::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (conn, _backend) = connected_pair("a").await;
        assert!(conn.ping(Duration::from_secs(5)).await.is_ok());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_ping_times_out_when_peer_is_silent() {
        // Nobody speaks HTTP/2 on the other end.
        let (bastion_io, _silent) = tokio::io::duplex(64 * 1024);
        let conn = BackendConnection::handshake(bastion_io, IdentityHash::of_public_key(b"b"))
            .await
            .unwrap();

        let result = conn.ping(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(UpstreamError::PingTimeout(_))));
    }

    #[tokio::test]
    async fn test_send_request_streams_body_both_ways() {
        let (conn, _backend) = connected_pair("a").await;

        let req = Request::builder()
            .method("POST")
            .uri("https://backend/echo?x=1")
            .body(AxumBody::from("hello"))
            .unwrap();
        let response = conn.send_request(req).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-backend"], "a");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"a /echo?x=1 hello");
    }

    #[tokio::test]
    async fn test_response_uses_inbound_version() {
        let (conn, _backend) = connected_pair("a").await;

        let req = Request::builder()
            .uri("https://backend/v")
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .unwrap();
        let response = conn.send_request(req).await.unwrap();
        assert_eq!(response.version(), Version::HTTP_11);
    }

    #[tokio::test]
    async fn test_closed_fires_when_backend_goes_away() {
        let (conn, backend) = connected_pair("a").await;
        backend.abort();

        timeout(Duration::from_secs(5), conn.closed())
            .await
            .expect("close notification");
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_drain_rejects_new_requests_and_closes() {
        let (conn, _backend) = connected_pair("a").await;
        conn.drain(Duration::from_secs(5)).await;

        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_request(get("https://backend/")).await,
            Err(UpstreamError::Draining)
        ));
    }

    #[tokio::test]
    async fn test_drain_lets_in_flight_request_finish() {
        let (conn, _backend) = slow_pair(Duration::from_millis(500)).await;

        let (result, ()) = timeout(Duration::from_secs(5), async {
            tokio::join!(fetch(&conn, "https://backend/slow"), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                conn.drain(Duration::from_secs(5)).await;
            })
        })
        .await
        .expect("drain completes once the stream finishes");

        assert_eq!(result.unwrap(), "slow ok");
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_drain_grace_elapsed_aborts_in_flight_request() {
        let (conn, _backend) = slow_pair(Duration::from_secs(30)).await;

        let (result, ()) = timeout(Duration::from_secs(5), async {
            tokio::join!(fetch(&conn, "https://backend/stuck"), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                conn.drain(Duration::from_millis(200)).await;
            })
        })
        .await
        .expect("an expired grace tears the session down");

        assert!(result.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_immediate() {
        let (conn, _backend) = connected_pair("a").await;
        conn.close();
        timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("abort cancels the close token");
    }
}
