//! Session driver: runs the state machine against real transports
//!
//! Each side's stream is read by its own task that turns frames, closes and
//! errors into `SessionEvent`s on one channel. The driver is the only place
//! that writes to either sink, so frames leave in the order the state machine
//! emits them.

use std::future::Future;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::frame::{CloseFrame, Frame};
use crate::session::{Action, Direction, Outcome, Session, SessionEvent};

/// Default bound on opening the upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the far side to finish a close handshake.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub close_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub dropped: u64,
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Upstream,
}

impl Side {
    fn frame(self, frame: Frame) -> SessionEvent {
        match self {
            Side::Client => SessionEvent::ClientFrame(frame),
            Side::Upstream => SessionEvent::UpstreamFrame(frame),
        }
    }

    fn closed(self, close: Option<CloseFrame>) -> SessionEvent {
        match self {
            Side::Client => SessionEvent::ClientClosed(close),
            Side::Upstream => SessionEvent::UpstreamClosed(close),
        }
    }

    fn error(self, message: String) -> SessionEvent {
        match self {
            Side::Client => SessionEvent::ClientError(message),
            Side::Upstream => SessionEvent::UpstreamError(message),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }
}

/// Forward everything `stream` yields as events until it closes, fails, or
/// the session is cancelled. A stream that ends without a close frame counts
/// as a transport error.
///
/// After a close frame the stream is still polled until it ends: WebSocket
/// transports send their close reply on the next read, so the peer's
/// handshake completes right away. Frames arriving in that window are dropped.
fn spawn_reader<S>(
    mut stream: S,
    side: Side,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut closed = false;
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => break,
                item = stream.next() => item,
            };
            if closed {
                match item {
                    Some(Ok(frame)) => {
                        debug!(side = side.name(), kind = frame.kind(), "frame after close dropped");
                        continue;
                    }
                    Some(Err(_)) | None => break,
                }
            }
            let (event, done) = match item {
                Some(Ok(Frame::Close(close))) => {
                    closed = true;
                    (side.closed(close), false)
                }
                Some(Ok(frame)) => (side.frame(frame), false),
                Some(Err(e)) => (side.error(e.0), true),
                None => (side.error("connection ended without close".to_string()), true),
            };
            if events.send(event).is_err() || done {
                break;
            }
        }
        debug!(side = side.name(), "reader stopped");
    });
}

/// Relay one client connection to an upstream opened by `connect`.
///
/// Client frames that arrive before `connect` resolves are queued and flushed
/// in arrival order. Returns once both sides are closed or the close grace
/// period has run out.
pub async fn run_session<CSink, CStream, USink, UStream, F>(
    mut client_sink: CSink,
    client_stream: CStream,
    connect: F,
    config: &RelayConfig,
) -> SessionReport
where
    CSink: Sink<Frame, Error = TransportError> + Unpin,
    CStream: Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
    USink: Sink<Frame, Error = TransportError> + Unpin,
    UStream: Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
    F: Future<Output = Result<(USink, UStream), TransportError>>,
{
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    spawn_reader(client_stream, Side::Client, events_tx.clone(), cancel.clone());

    let mut session = Session::new();
    let mut report = SessionReport::default();
    let mut upstream_sink: Option<USink> = None;

    let connect = tokio::time::timeout(config.connect_timeout, connect);
    tokio::pin!(connect);
    let mut connecting = true;

    let close_timer = tokio::time::sleep(config.close_grace);
    tokio::pin!(close_timer);
    let mut closing = false;

    debug!("session started, connecting upstream");

    while !session.is_closed() {
        let event = tokio::select! {
            result = &mut connect, if connecting => {
                connecting = false;
                match result {
                    Ok(Ok((sink, stream))) => {
                        upstream_sink = Some(sink);
                        spawn_reader(stream, Side::Upstream, events_tx.clone(), cancel.clone());
                        info!(queued = session.pending_len(), "upstream connected");
                        SessionEvent::UpstreamOpened
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "upstream connect failed");
                        SessionEvent::UpstreamConnectFailed
                    }
                    Err(_) => {
                        warn!(timeout_secs = config.connect_timeout.as_secs(), "upstream connect timed out");
                        SessionEvent::UpstreamConnectTimedOut
                    }
                }
            }
            Some(event) = events_rx.recv() => event,
            () = &mut close_timer, if closing => {
                closing = false;
                debug!("close grace expired");
                SessionEvent::CloseTimeout
            }
            else => break,
        };

        for action in session.handle(event) {
            match action {
                Action::SendUpstream(frame) => {
                    let Some(sink) = upstream_sink.as_mut() else {
                        report.dropped += 1;
                        continue;
                    };
                    debug!(kind = frame.kind(), preview = %frame.preview(), "client -> upstream");
                    match sink.send(frame).await {
                        Ok(()) => {
                            report.client_to_upstream += 1;
                            count_frame(Direction::ClientToUpstream);
                        }
                        Err(e) => {
                            report.dropped += 1;
                            warn!(error = %e, "send to upstream failed, frame dropped");
                        }
                    }
                }
                Action::SendClient(frame) => {
                    debug!(kind = frame.kind(), preview = %frame.preview(), "upstream -> client");
                    match client_sink.send(frame).await {
                        Ok(()) => {
                            report.upstream_to_client += 1;
                            count_frame(Direction::UpstreamToClient);
                        }
                        Err(e) => {
                            report.dropped += 1;
                            warn!(error = %e, "send to client failed, frame dropped");
                        }
                    }
                }
                Action::CloseClient(close) => {
                    debug!(close = ?close, "closing client");
                    send_close(&mut client_sink, close, config.close_grace).await;
                }
                Action::CloseUpstream(close) => {
                    if let Some(sink) = upstream_sink.as_mut() {
                        debug!(close = ?close, "closing upstream");
                        send_close(sink, close, config.close_grace).await;
                    }
                }
                Action::StartCloseTimer => {
                    close_timer.as_mut().reset(Instant::now() + config.close_grace);
                    closing = true;
                }
                Action::Drop { direction } => {
                    report.dropped += 1;
                    debug!(direction = direction.label(), "frame dropped, target side closed");
                }
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(config.close_grace, client_sink.close()).await;
    if let Some(mut sink) = upstream_sink {
        let _ = tokio::time::timeout(config.close_grace, sink.close()).await;
    }

    report.outcome = session.outcome();
    let outcome = report.outcome.map_or("unknown", |o| o.label());
    metrics::counter!("relay_sessions_total", "outcome" => outcome).increment(1);
    info!(
        outcome,
        client_to_upstream = report.client_to_upstream,
        upstream_to_client = report.upstream_to_client,
        dropped = report.dropped,
        "session closed"
    );
    report
}

async fn send_close<S>(sink: &mut S, close: Option<CloseFrame>, grace: Duration)
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    match tokio::time::timeout(grace, sink.send(Frame::Close(close))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "close frame not delivered"),
        Err(_) => debug!("close frame send timed out"),
    }
}

fn count_frame(direction: Direction) {
    metrics::counter!("relay_frames_total", "direction" => direction.label()).increment(1);
}
