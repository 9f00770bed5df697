//! WebSocket upgrade path
//!
//! Accepts the client upgrade, opens the upstream connection with
//! tokio-tungstenite and hands both sides to `duplex_relay::run_session`.
//! This module only adapts message types; ordering, buffering and close
//! propagation live in the relay crate.

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::extract::ws::{self, Message, WebSocket, WebSocketUpgrade};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::Secret;
use duplex_relay::{CloseFrame, Frame, RelayConfig, TransportError, run_session};
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_tungstenite::tungstenite;
use tracing::{Instrument, debug, info_span, warn};

use crate::proxy::{check_bearer, error_response, upstream_target};

#[derive(Clone)]
pub struct RelayState {
    /// ws:// or wss:// base the request path is appended to
    pub upstream_url: String,
    pub config: RelayConfig,
    pub require_auth: bool,
    pub auth_token: Option<Arc<Secret<String>>>,
    pub sessions_active: Arc<AtomicU64>,
}

/// Decrements the active-session gauge when the session task ends.
struct SessionGuard(Arc<AtomicU64>);

impl SessionGuard {
    fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Upgrade the client connection and relay it to `upstream_url + path + query`.
pub async fn handle_upgrade(
    state: &RelayState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let (mut parts, _body) = request.into_parts();

    if state.require_auth
        && let Err(response) = check_bearer(&parts.headers, state.auth_token.as_deref(), &request_id)
    {
        return response;
    }

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(request_id = %request_id, reason = %rejection, "not a websocket upgrade");
            return error_response(
                StatusCode::BAD_REQUEST,
                "Expected WebSocket connection",
                &request_id,
            );
        }
    };

    let target = upstream_target(&state.upstream_url, &parts.uri);
    // Path only: clients may carry their own key in the query string
    let span = info_span!("relay_session", request_id = %request_id, path = %parts.uri.path());
    let config = state.config.clone();
    let sessions_active = state.sessions_active.clone();

    upgrade.on_upgrade(move |socket| {
        async move {
            let _active = SessionGuard::new(sessions_active);
            let (sink, stream) = client_halves(socket);
            let report = run_session(sink, stream, connect_upstream(target), &config).await;
            debug!(
                client_to_upstream = report.client_to_upstream,
                upstream_to_client = report.upstream_to_client,
                "relay session finished"
            );
        }
        .instrument(span)
    })
}

fn client_halves(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = TransportError> + Unpin,
    impl Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| TransportError::new(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_client(frame))));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => from_client(message).map(Ok),
            Err(e) => Some(Err(TransportError::new(e.to_string()))),
        })
    });
    (sink, stream)
}

async fn connect_upstream(
    target: String,
) -> Result<
    (
        impl Sink<Frame, Error = TransportError> + Unpin,
        impl Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
    ),
    TransportError,
> {
    let (socket, _response) = tokio_tungstenite::connect_async(target)
        .await
        .map_err(|e| TransportError::new(e.to_string()))?;

    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| TransportError::new(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_upstream(frame))));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => from_upstream(message).map(Ok),
            Err(e) => Some(Err(TransportError::new(e.to_string()))),
        })
    });
    Ok((sink, stream))
}

fn from_client(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Close(close) => Some(Frame::Close(
            close.map(|c| CloseFrame::new(c.code, c.reason.as_str())),
        )),
        // Answered by axum
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: c.reason.into(),
        })),
    }
}

fn from_upstream(message: tungstenite::Message) -> Option<Frame> {
    match message {
        tungstenite::Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        tungstenite::Message::Binary(data) => Some(Frame::Binary(data)),
        tungstenite::Message::Close(close) => Some(Frame::Close(
            close.map(|c| CloseFrame::new(u16::from(c.code), c.reason.as_str())),
        )),
        tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => None,
        tungstenite::Message::Frame(_) => {
            warn!("unexpected raw frame from upstream, dropping");
            None
        }
    }
}

fn to_upstream(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Binary(data) => tungstenite::Message::Binary(data),
        Frame::Close(close) => tungstenite::Message::Close(close.map(|c| {
            tungstenite::protocol::CloseFrame {
                code: c.code.into(),
                reason: c.reason.into(),
            }
        })),
    }
}
