//! # Error Handling
//!
//! Error types for the voice session client and the policy for where each one
//! stops propagating.
//!
//! ## Error Categories:
//! - **Acquisition**: microphone/permission unavailable or audio device init failed.
//!   Fatal to the `connect()` attempt, state returns to idle.
//! - **Transport**: the remote stream errored or closed. Triggers full teardown.
//! - **Decode**: an inbound message or audio chunk was malformed. Logged and dropped.
//! - **Tool**: a tool handler failed. Captured into a `{error}` payload for the
//!   remote agent and surfaced to the UI; never terminates the session.
//!
//! Only Acquisition/Transport errors escalate to session-level state transitions.

use std::fmt;

/// Errors produced by the session client.
///
/// ## Usage Example:
/// ```rust
/// use soundscape_voice::error::SessionError;
///
/// let err = SessionError::Decode("odd byte count".to_string());
/// assert!(err.is_recoverable());
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Microphone, permission or audio clock could not be acquired
    #[error("Audio acquisition failed: {0}")]
    Acquisition(String),

    /// The remote stream reported an error, closed, or could not be opened
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound payload did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// A tool handler failed
    #[error("Tool error: {0}")]
    Tool(String),

    /// Configuration was missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// `connect()` was called while a session is already live
    #[error("A session is already active")]
    AlreadyActive,

    /// The requested operation is not allowed from the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connect attempt was cancelled by `disconnect()` before it finished
    #[error("Connect attempt cancelled")]
    Cancelled,
}

impl SessionError {
    /// Whether the error is contained at its originating component.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::Decode(_) | SessionError::Tool(_))
    }

    /// Human-readable message that is safe to show in the UI.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Acquisition(_) => {
                "Could not access microphone or audio device.".to_string()
            }
            SessionError::Transport(_) => "Connection error occurred.".to_string(),
            SessionError::Decode(_) => "Received malformed data from the assistant.".to_string(),
            SessionError::Tool(msg) => msg.clone(),
            SessionError::Config(msg) => format!("Configuration problem: {}", msg),
            SessionError::AlreadyActive => "A session is already running.".to_string(),
            SessionError::InvalidState(_) => "Reset the session before reconnecting.".to_string(),
            SessionError::Cancelled => "Connection attempt was cancelled.".to_string(),
        }
    }
}

/// Failure of a single tool handler.
///
/// ## Two messages:
/// - **message**: human-readable text, sent to the remote agent as `{error}` and
///   shown in the UI
/// - **cause**: internal detail (HTTP status, parse error) that is only logged
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}{}", render_cause(.cause))]
pub struct ToolError {
    pub message: String,
    pub cause: Option<String>,
}

fn render_cause(cause: &Option<String>) -> String {
    cause.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default()
}

impl ToolError {
    /// Create a tool error with only a user-visible message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an internal cause that will be logged but never forwarded.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl From<ToolError> for SessionError {
    fn from(err: ToolError) -> Self {
        SessionError::Tool(err.message)
    }
}

/// Automatic conversion from JSON errors.
///
/// JSON failures on the inbound path are always a malformed message from the
/// remote side, so they become decode errors.
impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Decode(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::Decode(format!("base64 decoding error: {}", err))
    }
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, SessionError>`.
pub type AppResult<T> = Result<T, SessionError>;
