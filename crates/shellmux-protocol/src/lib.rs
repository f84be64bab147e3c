use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque session identifier, assigned by the caller.
pub type SessionId = String;

/// Client-to-daemon commands sent as JSON-lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    CreateRemoteSession {
        #[serde(default)]
        request_id: Option<u64>,
        session_id: SessionId,
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<Password>,
        #[serde(default)]
        private_key_path: Option<PathBuf>,
        #[serde(default)]
        port_forwards: Vec<PortForward>,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    CreateLocalSession {
        #[serde(default)]
        request_id: Option<u64>,
        session_id: SessionId,
        #[serde(default)]
        initial_directory: Option<String>,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    SendInput {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    CloseSession {
        session_id: SessionId,
        #[serde(default = "default_user_initiated")]
        user_initiated: bool,
    },
    AcknowledgeConsumed {
        session_id: SessionId,
        byte_count: u64,
    },
    GetCurrentDirectory {
        #[serde(default)]
        request_id: Option<u64>,
        session_id: SessionId,
    },
    SessionList {
        #[serde(default)]
        request_id: Option<u64>,
    },
}

/// Daemon-to-client messages.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
        code: ErrorCode,
    },
    Event(Event),
}

impl Response {
    pub fn ok(request_id: Option<u64>, data: serde_json::Value) -> Self {
        Response::Ok {
            request_id,
            data: Some(data),
        }
    }

    pub fn error(request_id: Option<u64>, code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            request_id,
            message: message.into(),
            code,
        }
    }
}

/// Events pushed to the consumer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// One flushed batch of session output.
    SessionOutput { session_id: SessionId, text: String },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Event::SessionOutput { session_id, .. } | Event::SessionClosed { session_id, .. } => {
                session_id
            }
        }
    }
}

/// Why a session ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    User,
    Network,
    Auth,
    Timeout,
    Unknown,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    InvalidRequest,
    SpawnFailed,
    AuthenticationFailed,
    ConnectionTimeout,
    UnexpectedExit,
    SessionClosed,
    ServerError,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Remote,
    Local,
}

/// A local port forward: `[bind_address:]local_port:remote_host:remote_port`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub bind_address: Option<String>,
}

/// Summary returned by `session_list`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub state: String,
    pub queued_bytes: u64,
    pub paused: bool,
    pub cwd: Option<PathBuf>,
}

/// A credential that never shows up in `Debug` output.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_user_initiated() -> bool {
    true
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
