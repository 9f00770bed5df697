//! Bidirectional message relay between a client connection and an upstream one
//!
//! A session bridges one accepted client WebSocket to one upstream WebSocket
//! that is opened asynchronously. Frames the client sends before the upstream
//! is ready are queued and delivered in order once it opens. A close or error
//! on either side closes the other with the same code and reason.
//!
//! The crate is transport-neutral: callers adapt their socket types into
//! `Stream<Item = Result<Frame, TransportError>>` + `Sink<Frame>` pairs.
//! `session` holds the pure state machine, `bridge` drives it with I/O.

pub mod bridge;
pub mod error;
pub mod frame;
pub mod session;

pub use bridge::{RelayConfig, SessionReport, run_session};
pub use error::TransportError;
pub use frame::{CloseFrame, Frame, close_code};
pub use session::{Action, Direction, Liveness, Outcome, Session, SessionEvent, SessionState};
