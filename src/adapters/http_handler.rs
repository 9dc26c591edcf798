use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    routing::any,
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};
use tower_http::trace::TraceLayer;

use crate::{
    core::routing::{BackendTarget, split_path},
    ports::transport::{DispatchError, RoundTrip},
};

const NOT_ROUTED: &str = "request must start with /KEY_HASH/\n";

/// Connection-specific headers that never cross the proxy, besides any the
/// inbound `Connection` header names.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP handler for public requests addressed to `/<identity>/<path>`
#[derive(Clone)]
pub struct HttpHandler {
    round_trip: Arc<dyn RoundTrip>,
}

impl HttpHandler {
    pub fn new(round_trip: Arc<dyn RoundTrip>) -> Self {
        Self { round_trip }
    }

    /// Axum router serving every path through [`HttpHandler::handle_request`]
    pub fn router(self) -> Router {
        let handler = Arc::new(self);
        let make_request_route = |handler: Arc<HttpHandler>| {
            any(move |req: Request<AxumBody>| {
                let handler = handler.clone();
                async move {
                    let client_addr = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| *addr);
                    match handler.handle_request(req, client_addr).await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::error!("Request handling error: {:?}", e);
                            plain_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "Internal Server Error\n",
                            )
                        }
                    }
                }
            })
        };

        Router::new()
            .route("/{*path}", make_request_route(handler.clone()))
            .route("/", make_request_route(handler))
            .layer(TraceLayer::new_for_http())
    }

    /// Rewrite a public request and send it to the backend it names
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let Some(routed) = split_path(req.uri().path()) else {
            tracing::debug!("No backend segment in {}", req.uri().path());
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(AxumBody::from(NOT_ROUTED))
                .wrap_err("Failed to build 404 response");
        };
        let identity = routed.identity.to_string();
        let rest = routed.rest.to_string();

        let result = match rewrite_request(req, &identity, &rest, client_addr) {
            Ok(outbound) => self.round_trip.round_trip(outbound).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                let status = e.status_code();
                match &e {
                    DispatchError::InvalidIdentity(_) => tracing::debug!("Rejecting request: {}", e),
                    _ => tracing::warn!("Proxy error: {}", e),
                }
                Ok(plain_response(status, &format!("{e}\n")))
            }
        }
    }
}

/// Turn an inbound request into the outbound request for backend `identity`.
///
/// The outbound URI is `https://<identity><rest>?<query>`, with the query
/// passed through verbatim. The target identity also travels as a
/// [`BackendTarget`] extension for the dispatcher.
pub fn rewrite_request(
    req: Request<AxumBody>,
    identity: &str,
    rest: &str,
    client_addr: Option<SocketAddr>,
) -> Result<Request<AxumBody>, DispatchError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_string(),
    };
    let uri = Uri::builder()
        .scheme("https")
        .authority(identity)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| DispatchError::InvalidIdentity(format!("{identity:?}: {e}")))?;

    let inbound_host = parts
        .headers
        .get(header::HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(header::HOST);

    set_forwarded_headers(&mut parts.headers, client_addr, inbound_host);

    parts.uri = uri;
    parts.extensions.insert(BackendTarget(identity.to_string()));
    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }

    // "te: trailers" is the only TE value HTTP/2 permits.
    let keep_te = headers
        .get_all(header::TE)
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"));
    headers.remove(header::TE);
    if keep_te {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_addr: Option<SocketAddr>,
    inbound_host: Option<HeaderValue>,
) {
    headers.remove("x-forwarded-for");
    headers.remove("x-forwarded-host");
    headers.remove("x-forwarded-proto");

    if let Some(addr) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert("x-forwarded-for", value);
        }
    }
    if let Some(host) = inbound_host {
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
}

fn plain_response(status: StatusCode, body: &str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{core::identity::IdentityHash, ports::transport::DispatchResult};

    /// Records the outbound request and answers 200, or fails with a fixed error.
    #[derive(Default)]
    struct RecordingRoundTrip {
        seen: Mutex<Vec<Request<()>>>,
        fail_unavailable: bool,
    }

    #[async_trait]
    impl RoundTrip for RecordingRoundTrip {
        async fn round_trip(&self, req: Request<AxumBody>) -> DispatchResult<Response<AxumBody>> {
            let (parts, _body) = req.into_parts();
            let target = parts.extensions.get::<BackendTarget>().cloned();
            self.seen.lock().unwrap().push(Request::from_parts(parts, ()));

            if self.fail_unavailable {
                let identity = target.unwrap().identity().unwrap();
                return Err(DispatchError::BackendUnavailable(identity));
            }
            Ok(Response::new(AxumBody::from("backend says hi")))
        }
    }

    fn hash() -> String {
        IdentityHash::of_public_key(b"backend").to_hex()
    }

    fn public_request(uri: &str) -> Request<AxumBody> {
        let mut req = Request::builder()
            .uri(uri)
            .header(header::HOST, "bastion.example.com")
            .header("x-forwarded-for", "10.9.9.9")
            .header(header::CONNECTION, "keep-alive, x-secret")
            .header("x-secret", "hop")
            .header("x-app", "kept")
            .body(AxumBody::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("203.0.113.7:5555".parse().unwrap()));
        req
    }

    async fn body_string(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_routes_to_backend_with_rewrite() {
        let round_trip = Arc::new(RecordingRoundTrip::default());
        let router = HttpHandler::new(round_trip.clone()).router();

        let response = router
            .oneshot(public_request(&format!("/{}/foo/bar?x=1&y=%20", hash())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "backend says hi");

        let seen = round_trip.seen.lock().unwrap();
        let outbound = &seen[0];
        assert_eq!(
            outbound.uri().to_string(),
            format!("https://{}/foo/bar?x=1&y=%20", hash())
        );
        assert_eq!(
            outbound.extensions().get::<BackendTarget>(),
            Some(&BackendTarget(hash()))
        );
        let headers = outbound.headers();
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-secret").is_none());
        assert_eq!(headers["x-app"], "kept");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.7");
        assert_eq!(headers["x-forwarded-host"], "bastion.example.com");
        assert_eq!(headers["x-forwarded-proto"], "https");
    }

    #[tokio::test]
    async fn test_root_of_backend() {
        let round_trip = Arc::new(RecordingRoundTrip::default());
        let router = HttpHandler::new(round_trip.clone()).router();

        let response = router
            .oneshot(public_request(&format!("/{}/", hash())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(round_trip.seen.lock().unwrap()[0].uri().path(), "/");
    }

    #[tokio::test]
    async fn test_missing_backend_segment_is_404() {
        let bare_identity = format!("/{}", hash());
        for path in ["/", "/bogus", bare_identity.as_str()] {
            let round_trip = Arc::new(RecordingRoundTrip::default());
            let router = HttpHandler::new(round_trip.clone()).router();

            let response = router.oneshot(public_request(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {path}");
            assert_eq!(body_string(response).await, NOT_ROUTED);
            assert!(round_trip.seen.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_502() {
        let round_trip = Arc::new(RecordingRoundTrip {
            fail_unavailable: true,
            ..Default::default()
        });
        let router = HttpHandler::new(round_trip).router();

        let response = router
            .oneshot(public_request(&format!("/{}/x", hash())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unparseable_authority_is_400() {
        let round_trip = Arc::new(RecordingRoundTrip::default());
        let handler = HttpHandler::new(round_trip.clone());

        let response = handler
            .handle_request(public_request("/a:1:2/x"), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(round_trip.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_te_trailers_survives() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers[header::TE], "trailers");
        assert!(headers.get(header::UPGRADE).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::TE, HeaderValue::from_static("gzip"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(header::TE).is_none());
    }

    #[test]
    fn test_forwarded_headers_without_client_addr() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("spoofed"));
        set_forwarded_headers(&mut headers, None, None);
        assert!(headers.get("x-forwarded-for").is_none());
        assert_eq!(headers["x-forwarded-proto"], "https");
    }
}
