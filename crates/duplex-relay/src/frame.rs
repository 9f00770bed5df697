//! Relay frames and close codes

use bytes::Bytes;

/// WebSocket close codes used by the relay (RFC 6455 section 7.4.1).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn connect_failed() -> Self {
        Self::new(close_code::INTERNAL_ERROR, "Failed to connect to upstream")
    }

    pub fn connect_timed_out() -> Self {
        Self::new(close_code::INTERNAL_ERROR, "Upstream connect timed out")
    }

    pub fn upstream_error() -> Self {
        Self::new(close_code::INTERNAL_ERROR, "Upstream error")
    }

    pub fn client_went_away() -> Self {
        Self::new(close_code::GOING_AWAY, "Client went away")
    }
}

/// A message travelling through the relay. Ping/pong never get this far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Short description for logs: a text prefix or the binary length.
    pub fn preview(&self) -> String {
        match self {
            Frame::Text(text) => {
                let mut end = text.len().min(100);
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text[..end].to_string()
            }
            Frame::Binary(data) => format!("<binary {} bytes>", data.len()),
            Frame::Close(Some(close)) => format!("<close {} {}>", close.code, close.reason),
            Frame::Close(None) => "<close>".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Close(_) => "close",
        }
    }
}
