use std::time::Duration;
use tokio_tungstenite::tungstenite;

use crate::session::SessionState;

/// リレーのエラー型
///
/// いずれも致命的で、発生したセッションはそのまま終了する。
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("Authentication error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("WebSocket handshake failed with status code {status}: {body}")]
    HandshakeRejected { status: u16, body: String },

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("No reply received within {0:?}")]
    ReplyTimeout(Duration),

    #[error("Connection closed before a reply arrived")]
    ClosedBeforeReply,

    #[error("Unexpected frame format: {0}")]
    InvalidFrame(String),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Invalid session state: expected {expected:?}, found {found:?}")]
    InvalidState {
        expected: SessionState,
        found: SessionState,
    },

    #[error("Local side closed the output channel")]
    LocalClosed,

    #[error("Tool error: {0}")]
    Tool(#[from] tools::ToolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
