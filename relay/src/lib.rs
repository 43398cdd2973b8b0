pub mod client;
pub mod config;
pub mod echo;
pub mod envelope;
pub mod error;
pub mod playback;
pub mod session;

pub use client::{DEFAULT_OPEN_TIMEOUT, DEFAULT_REPLY_TIMEOUT, RelayConnection, echo_check};
pub use config::{McpServerConfig, RelayConfig};
pub use echo::EchoServer;
pub use envelope::{ConversationMessage, Envelope, ToolInvocation, ToolOutcome};
pub use error::RelayError;
pub use session::{CloseReason, LocalInput, LocalOutput, RelayOptions, SessionRelay, SessionState};
