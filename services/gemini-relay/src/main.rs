//! Gemini Relay
//!
//! Single-binary service that:
//! 1. Checks the client's bearer token
//! 2. Attaches an upstream API key, rotating through a quota-aware pool
//! 3. Proxies HTTP requests to generativelanguage.googleapis.com
//! 4. Bridges WebSocket upgrades to the upstream live endpoint

mod config;
mod error;
mod metrics;
mod provider_impl;
mod proxy;
mod service;
mod ws;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use common::Secret;
use key_pool::{CredentialPool, RotationManager};
use provider::{CredentialPlacement, Provider, StaticKeyProvider};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::{Config, KeysConfig};
use crate::provider_impl::PooledKeyProvider;
use crate::proxy::ProxyState;
use crate::service::{
    ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event,
};
use crate::ws::RelayState;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    relay: RelayState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Everything that is not /health or /metrics falls through to the relay
/// handler. The concurrency limit covers upgrades only until the handshake
/// response is sent; established sessions do not hold a slot.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(relay_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Choose how upstream keys are attached.
///
/// No keys leaves the service running so /health can report the problem;
/// HTTP requests then fail with 500.
fn build_provider(
    api_keys: Vec<Secret<String>>,
    keys: &KeysConfig,
    placement: CredentialPlacement,
) -> crate::error::Result<Option<Arc<dyn Provider>>> {
    let count = api_keys.len();
    if count > 1 && keys.rotate {
        let pool = CredentialPool::new(api_keys)?;
        let manager = Arc::new(RotationManager::new(pool, keys.policy())?);
        key_pool::spawn_reset_task(
            manager.clone(),
            Duration::from_secs(keys.sweep_interval_secs),
        );
        info!(
            keys = count,
            warning_threshold = keys.warning_threshold,
            daily_limit = keys.daily_limit,
            "key rotation enabled"
        );
        return Ok(Some(Arc::new(PooledKeyProvider::new(manager, placement))));
    }

    let Some(key) = api_keys.into_iter().next() else {
        warn!("no upstream API key configured, HTTP requests will fail with 500");
        return Ok(None);
    };
    if count > 1 {
        warn!(ignored = count - 1, "key rotation disabled, using the first key only");
    }
    Ok(Some(Arc::new(StaticKeyProvider::new(key, placement))))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        http_url = %config.upstream.http_url,
        ws_url = %config.upstream.ws_url,
        credential_mode = ?config.upstream.credential_mode,
        keys = config.keys.api_keys.len(),
        bearer_configured = config.server.auth_token.is_some(),
        "configuration loaded"
    );
    if config.server.auth_token.is_none() {
        warn!("no bearer token configured (CUSTOM_TOKEN or auth_token_file), HTTP requests will fail with 500");
    }

    // Transition: Initializing -> Starting
    let (new_state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
        },
    );
    state = new_state;

    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        _ => anyhow::bail!("unexpected action after ConfigLoaded: {action:?}"),
    };

    let api_keys = std::mem::take(&mut config.keys.api_keys);
    let provider = match build_provider(api_keys, &config.keys, config.upstream.placement()) {
        Ok(provider) => provider,
        Err(e) => {
            let _ = handle_event(state, ServiceEvent::StartupFailed(e.to_string()));
            return Err(e).context("failed to set up upstream keys");
        }
    };

    let metrics = ServiceMetrics::new();
    let auth_token = config.server.auth_token.take().map(Arc::new);

    let client = crate::proxy::upstream_client().context("failed to build upstream HTTP client")?;
    let proxy_state = ProxyState {
        client,
        upstream_url: config.upstream.http_url.clone(),
        timeout: Duration::from_secs(config.upstream.timeout_secs),
        auth_token: auth_token.clone(),
        provider,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let relay_state = RelayState {
        upstream_url: config.upstream.ws_url.clone(),
        config: config.relay.relay_config(),
        require_auth: config.relay.require_auth,
        auth_token,
        sessions_active: metrics.sessions_active.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        relay: relay_state,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listener = match TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(source) => {
            let e = crate::error::Error::Bind {
                addr: listen_addr,
                source,
            };
            let _ = handle_event(state, ServiceEvent::StartupFailed(e.to_string()));
            return Err(e.into());
        }
    };

    // Transition: Starting -> Running
    let (new_state, _action) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, "state: Running, accepting requests");

    // The drain timer starts at signal receipt: the server is told to stop
    // accepting, then the drain races the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Transition: Running -> Draining
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let drain_timeout = match action {
        ServiceAction::BeginDrain { timeout } => timeout,
        _ => anyhow::bail!("unexpected action after ShutdownSignal: {action:?}"),
    };

    let _ = shutdown_tx.send(());

    let event = match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            warn!(
                remaining = metrics.in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    // Transition: Draining -> Stopped
    let (_state, action) = handle_event(state, event);
    info!(
        sessions_open = metrics.sessions_active.load(Ordering::Relaxed),
        "shutdown complete"
    );
    if let ServiceAction::Shutdown { exit_code } = action
        && exit_code != 0
    {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Health endpoint: status, uptime, counters and key pool state.
/// Returns 503 only when no upstream key is configured; an exhausted pool is
/// reported in the body but still answers 200.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let in_flight = state.metrics.in_flight.load(Ordering::Relaxed);
    let sessions = state.metrics.sessions_active.load(Ordering::Relaxed);

    let (status_code, body) = match &state.proxy.provider {
        Some(provider) => {
            let health = provider.health().await;
            (
                StatusCode::OK,
                serde_json::json!({
                    "status": health.status,
                    "provider": provider.id(),
                    "key_pool": health.pool,
                    "uptime_seconds": uptime,
                    "requests_served": requests,
                    "errors_total": errors,
                    "in_flight": in_flight,
                    "sessions_active": sessions,
                }),
            )
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "provider": "not_configured",
                "uptime_seconds": uptime,
                "requests_served": requests,
                "errors_total": errors,
                "in_flight": in_flight,
                "sessions_active": sessions,
            }),
        ),
    };

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all: WebSocket upgrades go to the relay, everything else is proxied.
async fn relay_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    if request.headers().contains_key(header::UPGRADE) {
        ws::handle_upgrade(&state.relay, request, request_id).await
    } else {
        proxy::proxy_request(&state.proxy, request, request_id).await
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use duplex_relay::RelayConfig;
    use futures_util::{SinkExt, StreamExt};
    use key_pool::QuotaPolicy;
    use std::sync::Mutex;
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    const TOKEN: &str = "relay-secret";

    /// Create a PrometheusHandle for tests without installing a global recorder.
    /// Using build_recorder() avoids the "recorder already installed" panic when
    /// multiple tests run in the same process.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn static_key(key: &str) -> Option<Arc<dyn Provider>> {
        Some(Arc::new(StaticKeyProvider::new(
            Secret::new(key.to_string()),
            CredentialPlacement::default(),
        )))
    }

    fn pooled(keys: usize, warning_threshold: u32) -> (Arc<RotationManager>, Arc<dyn Provider>) {
        let secrets = (0..keys).map(|i| Secret::new(format!("AIza-{i}"))).collect();
        let manager = Arc::new(
            RotationManager::new(
                CredentialPool::new(secrets).unwrap(),
                QuotaPolicy {
                    warning_threshold,
                    daily_limit: warning_threshold + 5,
                    reset_after: Duration::from_secs(24 * 60 * 60),
                },
            )
            .unwrap(),
        );
        let provider: Arc<dyn Provider> = Arc::new(PooledKeyProvider::new(
            manager.clone(),
            CredentialPlacement::default(),
        ));
        (manager, provider)
    }

    /// Test app state forwarding HTTP to `upstream_url` and upgrades to `ws_url`.
    fn test_app_state(
        upstream_url: &str,
        ws_url: &str,
        provider: Option<Arc<dyn Provider>>,
    ) -> AppState {
        let metrics = ServiceMetrics::new();
        let auth_token = Some(Arc::new(Secret::new(TOKEN.to_string())));

        AppState {
            proxy: ProxyState {
                client: crate::proxy::upstream_client().unwrap(),
                upstream_url: upstream_url.to_string(),
                timeout: Duration::from_secs(5),
                auth_token: auth_token.clone(),
                provider,
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
                in_flight: metrics.in_flight.clone(),
            },
            relay: RelayState {
                upstream_url: ws_url.to_string(),
                config: RelayConfig::default(),
                require_auth: false,
                auth_token,
                sessions_active: metrics.sessions_active.clone(),
            },
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    fn authed(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {TOKEN}"))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Start a mock upstream server that echoes back request headers and body as JSON.
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new().fallback(|request: Request<Body>| async move {
                let mut headers_map = serde_json::Map::new();
                for (name, value) in request.headers() {
                    headers_map.insert(
                        name.to_string(),
                        serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                    );
                }
                let method = request.method().to_string();
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or("").to_string();
                let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                    .await
                    .unwrap();
                let body_str = String::from_utf8_lossy(&body_bytes).to_string();
                let body = serde_json::json!({
                    "echoed_headers": headers_map,
                    "method": method,
                    "path": path,
                    "query": query,
                    "body": body_str,
                });
                (
                    StatusCode::OK,
                    [
                        ("x-upstream-echo", "true"),
                        ("access-control-allow-origin", "https://upstream.example"),
                    ],
                    axum::Json(body),
                )
            });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    /// Upstream that always answers with the given status and body.
    async fn start_status_server(status: StatusCode, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(move || async move {
                (status, [("content-type", "application/json")], body)
            });
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Serve the relay on a real socket so WebSocket upgrades work.
    async fn serve_relay(state: AppState) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state, 1000);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state("http://unused", "ws://unused", static_key("AIza-one"));
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["provider"], "static");
        assert_eq!(json["requests_served"], 5);
        assert_eq!(json["sessions_active"], 0);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_endpoint_without_keys_is_degraded() {
        let state = test_app_state("http://unused", "ws://unused", None);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["provider"], "not_configured");
    }

    #[tokio::test]
    async fn health_endpoint_reports_pool_without_secrets() {
        let (_manager, provider) = pooled(3, 10);
        let state = test_app_state("http://unused", "ws://unused", Some(provider));
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["provider"], "key-pool");
        assert_eq!(json["key_pool"]["keys_total"], 3);
        assert!(!json.to_string().contains("AIza-"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state("http://unused", "ws://unused", None);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn proxy_rejects_missing_or_wrong_bearer() {
        for auth in [None, Some("Bearer wrong"), Some(TOKEN)] {
            let state = test_app_state("http://127.0.0.1:1", "ws://unused", static_key("AIza-one"));
            let app = build_router(state, 1000);
            let mut builder = Request::builder().uri("/v1beta/models");
            if let Some(auth) = auth {
                builder = builder.header("authorization", auth);
            }
            let response = app
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "auth: {auth:?}");
            let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let text = String::from_utf8_lossy(&body);
            assert!(text.contains("Unauthorized"));
            assert!(!text.contains(TOKEN), "401 body must not leak the token");
        }
    }

    #[tokio::test]
    async fn proxy_without_configured_token_returns_500() {
        let mut state = test_app_state("http://127.0.0.1:1", "ws://unused", static_key("AIza-one"));
        state.proxy.auth_token = None;
        let app = build_router(state, 1000);
        let response = app
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn proxy_without_upstream_key_returns_500() {
        let state = test_app_state("http://127.0.0.1:1", "ws://unused", None);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["error"]["message"], "Internal Server Error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
    }

    #[tokio::test]
    async fn options_preflight_answers_without_auth() {
        let state = test_app_state("http://127.0.0.1:1", "ws://unused", None);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1beta/models/gemini-pro:generateContent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(
            response.headers()["access-control-allow-methods"],
            "GET, POST, PUT, DELETE, OPTIONS"
        );
    }

    #[tokio::test]
    async fn proxy_injects_key_and_forwards_path_query_body() {
        let (upstream_url, _server) = start_echo_server().await;
        let state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                authed("/v1beta/models/gemini-pro:streamGenerateContent?alt=sse&key=client-key")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"contents":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream-echo"], "true");
        let json = json_body(response).await;

        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/v1beta/models/gemini-pro:streamGenerateContent");
        assert_eq!(json["query"], "alt=sse&key=AIza-test");
        assert_eq!(json["body"], r#"{"contents":[]}"#);
        assert_eq!(json["echoed_headers"]["content-type"], "application/json");
    }

    #[tokio::test]
    async fn proxy_strips_host_authorization_and_hop_by_hop() {
        let (upstream_url, _server) = start_echo_server().await;
        let state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                authed("/v1beta/models")
                    .header("host", "relay.example")
                    .header("connection", "keep-alive")
                    .header("x-custom", "preserved")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        let headers = &json["echoed_headers"];
        assert!(headers.get("authorization").is_none(), "relay token must not reach upstream");
        assert_ne!(headers["host"], "relay.example");
        assert!(headers.get("connection").is_none() || headers["connection"] != "keep-alive");
        assert_eq!(headers["x-custom"], "preserved");
    }

    #[tokio::test]
    async fn proxy_substitutes_body_placeholder() {
        let (upstream_url, _server) = start_echo_server().await;
        let provider: Arc<dyn Provider> = Arc::new(StaticKeyProvider::new(
            Secret::new("AIza-body".to_string()),
            CredentialPlacement::BodyPlaceholder {
                token: provider::placement::DEFAULT_PLACEHOLDER.to_string(),
            },
        ));
        let state = test_app_state(&upstream_url, "ws://unused", Some(provider));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                authed("/v1beta/models")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"apiKey":"{{GEMINI_API_KEY}}","note":"x {{GEMINI_API_KEY}}"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["query"], "");
        let forwarded: serde_json::Value =
            serde_json::from_str(json["body"].as_str().unwrap()).unwrap();
        assert_eq!(forwarded["apiKey"], "AIza-body");
        assert_eq!(forwarded["note"], "x {{GEMINI_API_KEY}}");
    }

    #[tokio::test]
    async fn proxy_overwrites_cors_headers() {
        let (upstream_url, _server) = start_echo_server().await;
        let state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(
            headers["access-control-allow-headers"],
            "Content-Type, Authorization"
        );
    }

    #[tokio::test]
    async fn proxy_passes_through_upstream_error_status_and_body() {
        let upstream_url = start_status_server(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"code":400,"message":"bad model"}}"#,
        )
        .await;
        let state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(authed("/v1beta/models/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        let json = json_body(response).await;
        assert_eq!(json["error"]["message"], "bad model");
    }

    #[tokio::test]
    async fn proxy_returns_upstream_redirects_without_following() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/v1beta/old",
                    get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/moved")]) }),
                )
                .route("/moved", get(|| async { "followed" }));
            axum::serve(listener, app).await.unwrap();
        });
        let state = test_app_state(&format!("http://{addr}"), "ws://unused", static_key("AIza-test"));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(authed("/v1beta/old").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/moved");
    }

    #[tokio::test]
    async fn proxy_returns_502_for_dead_upstream() {
        let state = test_app_state("http://127.0.0.1:1", "ws://unused", static_key("AIza-secret"));
        let errors_total = state.proxy.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(authed("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert_eq!(json["error"]["message"], "Proxy Error");
        assert!(!json.to_string().contains("AIza-secret"));
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn proxy_timeout_returns_504_gateway_timeout() {
        // Accepts connections but never responds
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let mut state = test_app_state(&format!("http://{addr}"), "ws://unused", static_key("AIza-test"));
        state.proxy.timeout = Duration::from_millis(50);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(authed("/v1/timeout").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = json_body(response).await;
        assert!(json["error"]["message"].as_str().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn pooled_requests_rotate_keys() {
        let (upstream_url, _server) = start_echo_server().await;
        let (manager, provider) = pooled(2, 10);
        let state = test_app_state(&upstream_url, "ws://unused", Some(provider));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let app = build_router(state.clone(), 1000);
            let response = app
                .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            seen.push(json_body(response).await["query"].as_str().unwrap().to_string());
        }

        assert_eq!(seen, ["key=AIza-0", "key=AIza-1", "key=AIza-0"]);
        let health = manager.health().await;
        assert_eq!(health["keys"][0]["request_count"], 2);
        assert_eq!(health["keys"][1]["request_count"], 1);
    }

    #[tokio::test]
    async fn quota_error_retires_key_then_exhaustion_returns_503() {
        let upstream_url = start_status_server(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","details":[{"violations":[{"quotaId":"GenerateRequestsPerDayPerProjectPerModel-FreeTier"}]}]}}"#,
        )
        .await;
        let (_manager, provider) = pooled(1, 5);
        let state = test_app_state(&upstream_url, "ws://unused", Some(provider));

        let first = build_router(state.clone(), 1000)
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::TOO_MANY_REQUESTS);

        let second = build_router(state, 1000)
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(second).await;
        assert_eq!(json["error"]["type"], "keys_exhausted");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(!json.to_string().contains("AIza-"));
    }

    #[tokio::test]
    async fn proxy_rejects_oversized_request_body() {
        let (upstream_url, _server) = start_echo_server().await;
        let state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        let errors_total = state.proxy.errors_total.clone();
        let app = build_router(state, 1000);

        let oversized = vec![b'x'; 10 * 1024 * 1024 + 1];
        let response = app
            .oneshot(
                authed("/v1beta/models")
                    .method("POST")
                    .body(Body::from(oversized))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn proxy_counts_requests_and_restores_in_flight() {
        let (upstream_url, _server) = start_echo_server().await;
        let state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        let requests_total = state.proxy.requests_total.clone();
        let in_flight = state.proxy.in_flight.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(in_flight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_contains_metric_names_after_request() {
        // Only one global recorder can exist per process; other tests use
        // isolated handles from test_prometheus_handle().
        use std::sync::OnceLock;
        static GLOBAL_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

        let handle = GLOBAL_HANDLE
            .get_or_init(|| metrics::install_recorder().expect("failed to install test recorder"))
            .clone();

        let (upstream_url, _server) = start_echo_server().await;
        let mut state = test_app_state(&upstream_url, "ws://unused", static_key("AIza-test"));
        state.prometheus = handle;

        let response = build_router(state.clone(), 1000)
            .oneshot(authed("/v1beta/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let metrics_response = build_router(state, 1000)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(metrics_response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let rendered = String::from_utf8(body.to_vec()).unwrap();

        assert!(
            rendered.contains("proxy_requests_total"),
            "/metrics must contain proxy_requests_total.\nRendered:\n{rendered}"
        );
        assert!(
            rendered.contains("proxy_request_duration_seconds"),
            "/metrics must contain proxy_request_duration_seconds.\nRendered:\n{rendered}"
        );
    }

    #[tokio::test]
    async fn upgrade_header_without_websocket_handshake_returns_400() {
        let state = test_app_state("http://unused", "ws://unused", None);
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("upgrade", "websocket")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["message"], "Expected WebSocket connection");
    }

    #[tokio::test]
    async fn upgrade_requires_bearer_when_configured() {
        let mut state = test_app_state("http://unused", "ws://unused", None);
        state.relay.require_auth = true;
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("upgrade", "websocket")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    /// Upstream WebSocket server for one session: records the request URI and
    /// the first message, replies with a binary frame, then closes (1000, "done").
    async fn start_ws_upstream() -> (String, tokio::sync::oneshot::Receiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let uri = Arc::new(Mutex::new(String::new()));
            let seen = uri.clone();
            let mut socket = tokio_tungstenite::accept_hdr_async(
                stream,
                move |request: &tungstenite::handshake::server::Request,
                      response: tungstenite::handshake::server::Response| {
                    *seen.lock().unwrap() = request.uri().to_string();
                    Ok(response)
                },
            )
            .await
            .unwrap();

            let first = socket.next().await.unwrap().unwrap();
            socket
                .send(tungstenite::Message::Binary(Bytes::from_static(b"\x01\x02\x03")))
                .await
                .unwrap();
            socket
                .close(Some(tungstenite::protocol::CloseFrame {
                    code: 1000.into(),
                    reason: "done".into(),
                }))
                .await
                .unwrap();
            while let Some(Ok(_)) = socket.next().await {}

            let uri = uri.lock().unwrap().clone();
            let _ = tx.send((uri, first.to_text().unwrap().to_owned()));
        });

        (format!("ws://{addr}"), rx)
    }

    #[tokio::test]
    async fn websocket_session_relays_both_directions() {
        let (ws_url, upstream_seen) = start_ws_upstream().await;
        let state = test_app_state("http://unused", &ws_url, None);
        let sessions_active = state.metrics.sessions_active.clone();
        let relay_addr = serve_relay(state).await;

        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{relay_addr}/ws/live?session=1"))
                .await
                .unwrap();
        // Sent before the relay has opened the upstream
        client
            .send(tungstenite::Message::Text("{\"ping\":1}".into()))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            tungstenite::Message::Binary(Bytes::from_static(b"\x01\x02\x03"))
        );

        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            tungstenite::Message::Close(Some(close)) => {
                assert_eq!(u16::from(close.code), 1000);
                assert_eq!(close.reason.as_str(), "done");
            }
            other => panic!("expected close, got {other:?}"),
        }

        // Reading on sends our close reply; the relay then drops the connection
        let end = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap();
        assert!(
            matches!(end, None | Some(Err(_))),
            "unexpected message after close: {end:?}"
        );

        let (uri, first) = tokio::time::timeout(Duration::from_secs(2), upstream_seen)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uri, "/ws/live?session=1");
        assert_eq!(first, "{\"ping\":1}");

        // The session task winds down once both sides are closed
        let mut remaining = 1;
        for _ in 0..50 {
            remaining = sessions_active.load(Ordering::Relaxed);
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn websocket_upstream_unreachable_closes_client_with_1011() {
        let state = test_app_state("http://unused", "ws://127.0.0.1:1", None);
        let relay_addr = serve_relay(state).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{relay_addr}/ws"))
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            tungstenite::Message::Close(Some(close)) => {
                assert_eq!(u16::from(close.code), 1011);
                assert_eq!(close.reason.as_str(), "Failed to connect to upstream");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_provider_picks_strategy_from_key_count() {
        let keys = KeysConfig::default();

        let none = build_provider(vec![], &keys, CredentialPlacement::default()).unwrap();
        assert!(none.is_none());

        let one = build_provider(
            vec![Secret::new("AIza-0".into())],
            &keys,
            CredentialPlacement::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(one.id(), "static");

        let many = build_provider(
            vec![Secret::new("AIza-0".into()), Secret::new("AIza-1".into())],
            &keys,
            CredentialPlacement::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(many.id(), "key-pool");

        let no_rotation = KeysConfig {
            rotate: false,
            ..KeysConfig::default()
        };
        let first_only = build_provider(
            vec![Secret::new("AIza-0".into()), Secret::new("AIza-1".into())],
            &no_rotation,
            CredentialPlacement::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(first_only.id(), "static");
    }
}
