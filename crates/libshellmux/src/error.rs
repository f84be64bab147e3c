use thiserror::Error;
use shellmux_protocol::{ErrorCode, SessionId};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("authentication failed for session {0}")]
    AuthenticationFailed(SessionId),

    #[error("session {session_id} not established within {timeout_secs}s")]
    ConnectionTimeout {
        session_id: SessionId,
        timeout_secs: u64,
    },

    #[error("session {session_id} exited before it was established (exit code {exit_code:?})")]
    UnexpectedExit {
        session_id: SessionId,
        exit_code: Option<i32>,
    },

    #[error("session {0} was closed before it was established")]
    SessionClosed(SessionId),

    #[error("event sink unavailable")]
    SinkUnavailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            SessionError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            SessionError::Spawn(_) => (ErrorCode::SpawnFailed, self.to_string()),
            SessionError::AuthenticationFailed(_) => {
                (ErrorCode::AuthenticationFailed, self.to_string())
            }
            SessionError::ConnectionTimeout { .. } => {
                (ErrorCode::ConnectionTimeout, self.to_string())
            }
            SessionError::UnexpectedExit { .. } => (ErrorCode::UnexpectedExit, self.to_string()),
            SessionError::SessionClosed(_) => (ErrorCode::SessionClosed, self.to_string()),
            SessionError::SinkUnavailable => (ErrorCode::ServerError, self.to_string()),
            SessionError::InvalidConfig(_) => (ErrorCode::InvalidRequest, self.to_string()),
            SessionError::Pty(_) => (ErrorCode::ServerError, self.to_string()),
            SessionError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
