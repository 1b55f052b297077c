use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a session.
pub type SessionId = String;

/// Identifies one attachment of a connection to a session.
pub type AttachmentId = String;

/// Default size of the per-session scrollback ring buffer, in bytes.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 256 * 1024;

/// Maximum length of a session name, in characters.
pub const MAX_SESSION_NAME_CHARS: usize = 50;

/// Client-to-server messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateSession {
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
        /// Opaque token echoed back in `session_created` or `error`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    ListSessions,
    ReattachSession {
        session_id: SessionId,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },
    Input {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        session_id: SessionId,
        rows: u16,
        cols: u16,
    },
    RenameSession {
        session_id: SessionId,
        name: String,
    },
    CloseSession {
        session_id: SessionId,
    },
    DetachSession {
        session_id: SessionId,
    },
}

/// Server-to-client messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionCreated {
        session_id: SessionId,
        name: String,
        #[serde(serialize_with = "lossy_path::serialize")]
        working_directory: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    SessionReattached {
        session_id: SessionId,
        name: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            serialize_with = "lossy_path::serialize_opt"
        )]
        working_directory: Option<PathBuf>,
    },
    /// Buffered output replayed right after `session_reattached`.
    Scrollback {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Output {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    SessionExited {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    SessionDetached {
        session_id: SessionId,
        reason: DetachReason,
    },
    SessionRenamed {
        session_id: SessionId,
        name: String,
    },
    SessionClosed {
        session_id: SessionId,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            session_id: None,
            request_id: None,
        }
    }

    pub fn session_error(
        code: ErrorCode,
        message: impl Into<String>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self::Error {
            code,
            message: message.into(),
            session_id: Some(session_id.into()),
            request_id: None,
        }
    }

    /// Session the message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionReattached { session_id, .. }
            | Self::Scrollback { session_id, .. }
            | Self::Output { session_id, .. }
            | Self::SessionExited { session_id, .. }
            | Self::SessionDetached { session_id, .. }
            | Self::SessionRenamed { session_id, .. }
            | Self::SessionClosed { session_id } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::SessionList { .. } => None,
        }
    }
}

/// Why a connection lost its attachment to a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// Another connection reattached the session (last attach wins).
    Displaced,
    /// The connection asked to detach.
    Requested,
    /// The connection stopped draining its output queue. The session keeps
    /// buffering and can be reattached.
    Lagged,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionExited,
    SpawnFailed,
    InvalidRequest,
    InvalidName,
    NotAttached,
    ServerError,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Summary returned by `list_sessions`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    /// Epoch milliseconds.
    pub created_at: u64,
    /// Epoch milliseconds.
    pub last_active_at: u64,
    #[serde(serialize_with = "lossy_path::serialize")]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub attached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl SessionInfo {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Paths go out as strings; non-UTF-8 components are replaced rather than
/// failing the whole message.
mod lossy_path {
    use serde::Serializer;
    use std::path::{Path, PathBuf};

    pub fn serialize<P: AsRef<Path>, S: Serializer>(path: &P, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&path.as_ref().to_string_lossy())
    }

    pub fn serialize_opt<S: Serializer>(path: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        match path {
            Some(path) => s.serialize_some(path.to_string_lossy().as_ref()),
            None => s.serialize_none(),
        }
    }
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
