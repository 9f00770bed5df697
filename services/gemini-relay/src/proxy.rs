//! HTTP forwarding
//!
//! Checks the bearer token, strips host, authorization and hop-by-hop headers,
//! lets the provider attach an upstream key, and forwards to the upstream URL.
//! Upstream status and body are returned unchanged (including error statuses)
//! with CORS headers overwritten. Success responses are streamed; error bodies
//! are buffered so the provider can classify them.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use common::Secret;
use provider::{ErrorClassification, Provider, ProviderError, UpstreamRequest};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body accepted for forwarding
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const CORS_HEADERS: [(&str, &str); 3] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST, PUT, DELETE, OPTIONS"),
    ("access-control-allow-headers", "Content-Type, Authorization"),
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub auth_token: Option<Arc<Secret<String>>>,
    /// `None` when no upstream key is configured; requests then fail with 500.
    pub provider: Option<Arc<dyn Provider>>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

impl ProxyState {
    fn reject(&self, status: StatusCode, message: &str, request_id: &str) -> Response {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        error_response(status, message, request_id)
    }
}

/// HTTP client for upstream calls. Redirects are handed back to the caller
/// unchanged instead of being followed.
pub fn upstream_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Decrements the in-flight counter when the request finishes, however it ends.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// 503 carrying the pool summary from the rotation manager. The summary holds
/// counts only, never key material.
fn exhausted_response(summary: &str, request_id: &str) -> Response {
    let Ok(mut body) = serde_json::from_str::<serde_json::Value>(summary) else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "All API keys are at their daily quota",
            request_id,
        );
    };
    if let Some(error) = body.get_mut("error").and_then(|e| e.as_object_mut()) {
        error.insert("request_id".into(), request_id.into());
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Compare the `Authorization: Bearer <token>` header against the configured token.
///
/// No configured token is a server misconfiguration (500), never an open door.
pub fn check_bearer(
    headers: &HeaderMap,
    expected: Option<&Secret<String>>,
    request_id: &str,
) -> Result<(), Response> {
    let Some(expected) = expected else {
        error!("no bearer token configured, rejecting request");
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            request_id,
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if expected.matches(token) => Ok(()),
        _ => {
            debug!("bearer token missing or mismatched");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                request_id,
            ))
        }
    }
}

fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in CORS_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

/// Answer a CORS preflight without touching the upstream.
fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(response.headers_mut());
    response
}

/// `base` + the request's path and query, verbatim.
pub fn upstream_target(base: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

/// Request headers to send upstream.
///
/// Host is set by the client from the URL; authorization carries the relay's
/// own token; content-length is recomputed because the body may be rewritten.
fn forward_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name.as_str())
            || name == header::HOST
            || name == header::AUTHORIZATION
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    apply_cors(&mut headers);
    headers
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Forward an inbound request to the upstream with the configured key attached.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::new(state.in_flight.clone());

    let response = forward(state, request, &request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(state: &ProxyState, request: Request<Body>, request_id: &str) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight_response();
    }

    if let Err(response) = check_bearer(request.headers(), state.auth_token.as_deref(), request_id)
    {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
        return response;
    }

    let Some(provider) = state.provider.as_ref() else {
        error!("no upstream API key configured");
        return state.reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            request_id,
        );
    };

    let url = match reqwest::Url::parse(&upstream_target(&state.upstream_url, request.uri())) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "could not build upstream URL");
            return state.reject(StatusCode::BAD_REQUEST, "Invalid request URL", request_id);
        }
    };
    let method = request.method().clone();
    let headers = forward_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return state.reject(StatusCode::BAD_REQUEST, "Invalid request body", request_id);
        }
    };

    let mut upstream = UpstreamRequest { url, headers, body };
    let lease = match provider.prepare_request(&mut upstream).await {
        Ok(lease) => lease,
        Err(ProviderError::PoolExhausted(summary)) => {
            metrics::record_upstream_error("keys_exhausted");
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            return exhausted_response(&summary, request_id);
        }
        Err(e) => {
            error!(error = %e, provider = provider.id(), "failed to attach upstream key");
            return state.reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                request_id,
            );
        }
    };

    let send = state
        .client
        .request(method, upstream.url)
        .headers(upstream.headers)
        .body(upstream.body)
        .send();

    // Bounds the wait for response headers only; streamed bodies may run longer.
    let upstream_response = match tokio::time::timeout(state.timeout, send).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            // The URL carries the key in query mode
            let e = e.without_url();
            metrics::record_upstream_error("connection");
            error!(error = %e, "upstream request failed");
            return state.reject(StatusCode::BAD_GATEWAY, "Proxy Error", request_id);
        }
        Err(_) => {
            metrics::record_upstream_error("timeout");
            error!(
                timeout_secs = state.timeout.as_secs(),
                "upstream timeout"
            );
            return state.reject(
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream timeout",
                request_id,
            );
        }
    };

    let status = upstream_response.status();
    let headers = response_headers(upstream_response.headers());

    if !status.is_client_error() && !status.is_server_error() {
        if let Some(lease) = lease {
            provider.report_success(lease).await;
        }
        return build_response(
            status,
            headers,
            Body::from_stream(upstream_response.bytes_stream()),
        );
    }

    let body = match upstream_response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            metrics::record_upstream_error("body_read");
            error!(error = %e.without_url(), "failed to read upstream error body");
            return state.reject(StatusCode::BAD_GATEWAY, "Proxy Error", request_id);
        }
    };

    let classification = provider.classify_error(status.as_u16(), &String::from_utf8_lossy(&body));
    warn!(
        status = status.as_u16(),
        classification = ?classification,
        "upstream returned error status"
    );
    if classification == ErrorClassification::QuotaExceeded {
        metrics::record_upstream_error("quota_exceeded");
    }
    if let Some(lease) = lease {
        provider.report_error(lease, classification).await;
    }

    build_response(status, headers, Body::from(body))
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
