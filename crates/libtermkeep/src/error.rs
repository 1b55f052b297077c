use termkeep_protocol::{ErrorCode, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TermkeepError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exited: {0}")]
    SessionExited(SessionId),

    #[error("not attached to session {0}")]
    NotAttached(SessionId),

    #[error("invalid session name: {0}")]
    InvalidName(String),

    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("input queue full for session {0}")]
    InputQueueFull(SessionId),

    #[error("output queue full, connection is not reading")]
    OutputQueueFull,

    #[error("pty error: {0}")]
    PtyError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TermkeepError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            TermkeepError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            TermkeepError::SessionExited(_) => (ErrorCode::SessionExited, self.to_string()),
            TermkeepError::NotAttached(_) => (ErrorCode::NotAttached, self.to_string()),
            TermkeepError::InvalidName(_) => (ErrorCode::InvalidName, self.to_string()),
            TermkeepError::SpawnFailed(_) => (ErrorCode::SpawnFailed, self.to_string()),
            TermkeepError::InputQueueFull(_) | TermkeepError::OutputQueueFull => {
                (ErrorCode::ServerError, self.to_string())
            }
            TermkeepError::PtyError(_) => (ErrorCode::ServerError, self.to_string()),
            TermkeepError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
