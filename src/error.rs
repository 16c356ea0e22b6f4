//! # Error Handling
//!
//! Error types for the voice exam session engine.
//!
//! ## Error Categories:
//! - **Fatal**: the session cannot continue and moves to `Errored`
//!   (`PermissionDenied`, `ConnectionLost`, `Device`, `Config`, `ChannelClosed`)
//! - **Local**: recovered where they happen without changing the session state
//!   (`MalformedAudioData`, `ToolCallUnrecognized`, `Protocol`)
//! - **Absorbed**: `TeardownRace` is never surfaced; a second teardown is not an error
//!
//! Each fatal error maps to exactly one human-readable reason that is handed to
//! the consumer through `SessionNotification::Error`.

use thiserror::Error;

/// Errors produced by the session engine.
///
/// ## Why Clone + PartialEq:
/// The error is stored inside `SessionState::Errored` and published to consumers,
/// so it carries only owned strings rather than source error objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The microphone could not be acquired (user denied access or no device)
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The duplex session with the remote endpoint failed or dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An audio payload could not be decoded into PCM samples
    #[error("Malformed audio data: {0}")]
    MalformedAudioData(String),

    /// The remote model called a tool this engine does not know
    #[error("Unrecognized tool call: {0}")]
    ToolCallUnrecognized(String),

    /// Teardown was requested after resources were already released
    #[error("Session resources already released")]
    TeardownRace,

    /// An audio device failed after it was acquired
    #[error("Audio device error: {0}")]
    Device(String),

    /// A message from the remote endpoint did not follow the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Engine or exam configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session actor is gone (the session already ended)
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_)
                | SessionError::ConnectionLost(_)
                | SessionError::Device(_)
                | SessionError::Config(_)
                | SessionError::ChannelClosed(_)
        )
    }

    /// Machine-readable error code, used in logs and notifications.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::PermissionDenied(_) => "permission_denied",
            SessionError::ConnectionLost(_) => "connection_lost",
            SessionError::MalformedAudioData(_) => "malformed_audio_data",
            SessionError::ToolCallUnrecognized(_) => "tool_call_unrecognized",
            SessionError::TeardownRace => "teardown_race",
            SessionError::Device(_) => "device_error",
            SessionError::Protocol(_) => "protocol_error",
            SessionError::Config(_) => "config_error",
            SessionError::ChannelClosed(_) => "channel_closed",
        }
    }

    /// The single human-readable reason shown to the user for a fatal error.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::PermissionDenied(_) => {
                "Microphone access was denied. Allow microphone access and restart the exam.".to_string()
            }
            SessionError::ConnectionLost(_) => "Connection Lost. Please restart.".to_string(),
            SessionError::Device(msg) => format!("Audio device failed: {}. Please restart.", msg),
            SessionError::Config(msg) => format!("Failed to start exam session: {}", msg),
            SessionError::ChannelClosed(_) => "The exam session has already ended.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(err: base64::DecodeError) -> Self {
        SessionError::MalformedAudioData(format!("base64 payload: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::ConnectionLost(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Device(err.to_string())
    }
}

/// Type alias for Results that use the engine error type.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::PermissionDenied("denied".into()).is_fatal());
        assert!(SessionError::ConnectionLost("reset".into()).is_fatal());
        assert!(!SessionError::MalformedAudioData("odd".into()).is_fatal());
        assert!(!SessionError::ToolCallUnrecognized("x".into()).is_fatal());
        assert!(!SessionError::TeardownRace.is_fatal());
    }

    #[test]
    fn test_user_message_is_distinguishable() {
        let denied = SessionError::PermissionDenied("no device".into()).user_message();
        let lost = SessionError::ConnectionLost("eof".into()).user_message();
        assert!(denied.contains("Microphone"));
        assert_eq!(lost, "Connection Lost. Please restart.");
        assert_ne!(denied, lost);
    }

    #[test]
    fn test_json_error_conversion() {
        let err: SessionError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "protocol_error");
    }
}
