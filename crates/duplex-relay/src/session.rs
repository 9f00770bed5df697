//! Per-session relay state machine
//!
//! Pure state machine: receives events, returns actions. The bridge driver
//! executes the I/O each action implies, so buffering order and close
//! propagation are decided here and nowhere else.
//!
//! Transitions:
//! - Connecting → Bridging (upstream opened, pending frames flushed in order)
//! - Connecting → ClosingUpstream (connect failed or timed out, client closed 1011)
//! - Connecting → Closed (client left before the upstream opened)
//! - Bridging → ClosingClient (client closed or failed, upstream closed to match)
//! - Bridging → ClosingUpstream (upstream closed or failed, client closed to match)
//! - Closing* → Closed (other side finished closing, or close grace expired)

use std::collections::VecDeque;

use crate::frame::{CloseFrame, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upstream requested, not yet open. Client frames are queued.
    Connecting,
    /// Both sides open, frames flow both ways.
    Bridging,
    /// Client closed first; waiting for the upstream to finish closing.
    ClosingClient,
    /// Upstream closed or failed first; waiting for the client to finish closing.
    ClosingUpstream,
    /// Terminal.
    Closed,
}

/// Liveness of one side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

/// What ended the session, for logs and the sessions metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ClientClosed,
    ClientError,
    UpstreamClosed,
    UpstreamError,
    ConnectFailed,
    ConnectTimedOut,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::ClientClosed => "client_closed",
            Outcome::ClientError => "client_error",
            Outcome::UpstreamClosed => "upstream_closed",
            Outcome::UpstreamError => "upstream_error",
            Outcome::ConnectFailed => "connect_failed",
            Outcome::ConnectTimedOut => "connect_timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    UpstreamOpened,
    UpstreamConnectFailed,
    UpstreamConnectTimedOut,
    ClientFrame(Frame),
    UpstreamFrame(Frame),
    ClientClosed(Option<CloseFrame>),
    UpstreamClosed(Option<CloseFrame>),
    ClientError(String),
    UpstreamError(String),
    /// The close handshake took longer than the grace period.
    CloseTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendUpstream(Frame),
    SendClient(Frame),
    CloseClient(Option<CloseFrame>),
    CloseUpstream(Option<CloseFrame>),
    /// Bound the wait for the other side's close.
    StartCloseTimer,
    /// A frame arrived for a side that can no longer receive it.
    Drop { direction: Direction },
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    client: Liveness,
    upstream: Liveness,
    pending: VecDeque<Frame>,
    outcome: Option<Outcome>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            client: Liveness::Open,
            upstream: Liveness::Closed,
            pending: VecDeque::new(),
            outcome: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> Liveness {
        self.client
    }

    pub fn upstream(&self) -> Liveness {
        self.upstream
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Apply one event and return the I/O to perform, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        match (self.state, event) {
            (SessionState::Closed, _) => Vec::new(),

            // --- Connecting ---
            (SessionState::Connecting, SessionEvent::ClientFrame(frame)) => {
                self.pending.push_back(frame);
                Vec::new()
            }
            (SessionState::Connecting, SessionEvent::UpstreamOpened) => {
                self.state = SessionState::Bridging;
                self.upstream = Liveness::Open;
                self.pending.drain(..).map(Action::SendUpstream).collect()
            }
            (SessionState::Connecting, SessionEvent::UpstreamConnectFailed) => {
                self.fail_connect(Outcome::ConnectFailed, CloseFrame::connect_failed())
            }
            (SessionState::Connecting, SessionEvent::UpstreamConnectTimedOut) => {
                self.fail_connect(Outcome::ConnectTimedOut, CloseFrame::connect_timed_out())
            }
            (SessionState::Connecting, SessionEvent::ClientClosed(_)) => {
                self.finish(Outcome::ClientClosed)
            }
            (SessionState::Connecting, SessionEvent::ClientError(_)) => {
                self.finish(Outcome::ClientError)
            }

            // --- Bridging ---
            (SessionState::Bridging, SessionEvent::ClientFrame(frame)) => {
                vec![Action::SendUpstream(frame)]
            }
            (SessionState::Bridging, SessionEvent::UpstreamFrame(frame)) => {
                self.forward_to_client(frame)
            }
            (SessionState::Bridging, SessionEvent::ClientClosed(close)) => {
                self.client_gone(Outcome::ClientClosed, close)
            }
            (SessionState::Bridging, SessionEvent::ClientError(_)) => {
                self.client_gone(Outcome::ClientError, Some(CloseFrame::client_went_away()))
            }
            (SessionState::Bridging, SessionEvent::UpstreamClosed(close)) => {
                self.upstream_gone(Outcome::UpstreamClosed, close)
            }
            (SessionState::Bridging, SessionEvent::UpstreamError(_)) => {
                self.upstream_gone(Outcome::UpstreamError, Some(CloseFrame::upstream_error()))
            }

            // --- ClosingClient: client is gone, upstream finishing ---
            (
                SessionState::ClosingClient,
                SessionEvent::UpstreamClosed(_)
                | SessionEvent::UpstreamError(_)
                | SessionEvent::CloseTimeout,
            ) => self.close_all(),
            (SessionState::ClosingClient, SessionEvent::UpstreamFrame(_)) => vec![Action::Drop {
                direction: Direction::UpstreamToClient,
            }],

            // --- ClosingUpstream: upstream is gone, client finishing ---
            (
                SessionState::ClosingUpstream,
                SessionEvent::ClientClosed(_) | SessionEvent::ClientError(_) | SessionEvent::CloseTimeout,
            ) => self.close_all(),
            (SessionState::ClosingUpstream, SessionEvent::ClientFrame(_)) => vec![Action::Drop {
                direction: Direction::ClientToUpstream,
            }],

            // --- Anything else is stale or impossible for the state: ignore ---
            (_, _) => Vec::new(),
        }
    }

    fn forward_to_client(&mut self, frame: Frame) -> Vec<Action> {
        if self.client == Liveness::Open {
            vec![Action::SendClient(frame)]
        } else {
            vec![Action::Drop {
                direction: Direction::UpstreamToClient,
            }]
        }
    }

    fn fail_connect(&mut self, outcome: Outcome, close: CloseFrame) -> Vec<Action> {
        self.outcome = Some(outcome);
        self.pending.clear();
        self.state = SessionState::ClosingUpstream;
        let mut actions = self.close_client(Some(close));
        actions.push(Action::StartCloseTimer);
        actions
    }

    fn client_gone(&mut self, outcome: Outcome, close: Option<CloseFrame>) -> Vec<Action> {
        self.outcome = Some(outcome);
        self.client = Liveness::Closed;
        self.state = SessionState::ClosingClient;
        let mut actions = self.close_upstream(close);
        actions.push(Action::StartCloseTimer);
        actions
    }

    fn upstream_gone(&mut self, outcome: Outcome, close: Option<CloseFrame>) -> Vec<Action> {
        self.outcome = Some(outcome);
        self.upstream = Liveness::Closed;
        self.state = SessionState::ClosingUpstream;
        let mut actions = self.close_client(close);
        actions.push(Action::StartCloseTimer);
        actions
    }

    /// Terminal without a handshake to wait for.
    fn finish(&mut self, outcome: Outcome) -> Vec<Action> {
        self.outcome = Some(outcome);
        self.pending.clear();
        self.close_all()
    }

    fn close_all(&mut self) -> Vec<Action> {
        self.state = SessionState::Closed;
        self.client = Liveness::Closed;
        self.upstream = Liveness::Closed;
        Vec::new()
    }

    fn close_client(&mut self, close: Option<CloseFrame>) -> Vec<Action> {
        if self.client != Liveness::Open {
            return Vec::new();
        }
        self.client = Liveness::Closing;
        vec![Action::CloseClient(close)]
    }

    fn close_upstream(&mut self, close: Option<CloseFrame>) -> Vec<Action> {
        if self.upstream != Liveness::Open {
            return Vec::new();
        }
        self.upstream = Liveness::Closing;
        vec![Action::CloseUpstream(close)]
    }
}
