//! Error taxonomy for the session engine.
//!
//! Every failure a client can observe is a [`SessionError`]. Each variant is
//! scoped to one session: nothing here ever describes another session's
//! state. Transports render errors through [`SessionError::to_jsonrpc_error`]
//! and pick an HTTP status with [`SessionError::http_status`].
//!
//! # Error Code Ranges
//!
//! - `-32600`: standard JSON-RPC invalid request
//! - `-32010` to `-32016`: sheetmux session errors

pub mod jsonrpc;

pub use jsonrpc::{ErrorData, JsonRpcError};

use thiserror::Error;

use crate::jsonrpc::JsonRpcId;

/// Client-visible failures of a proxied call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The child process for this session could not be started.
    ///
    /// Fatal for this attempt only; the next call tries to spawn again.
    #[error("Failed to start tool server for session '{session_id}': {reason}")]
    SpawnFailure { session_id: String, reason: String },

    /// The child wrote something that is not a single JSON-RPC 2.0 object.
    ///
    /// The endpoint is terminated and the session evicted.
    #[error("Tool server for session '{session_id}' broke protocol framing: {reason}")]
    ProtocolFraming { session_id: String, reason: String },

    /// The child exited unexpectedly. Every pending call on it fails with this.
    #[error("Tool server for session '{session_id}' exited unexpectedly")]
    ChildCrashed { session_id: String },

    /// No response arrived within the per-call timeout. The session stays alive.
    #[error("Call on session '{session_id}' timed out after {timeout_ms}ms")]
    CallTimeout { session_id: String, timeout_ms: u64 },

    /// Explicit termination of a session id that is not in the table.
    #[error("Session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    /// The idle reaper evicted the session while this call was waiting.
    #[error("Session '{session_id}' was evicted after being idle")]
    IdleEvicted { session_id: String },

    /// The session was terminated explicitly, by connection close, or by shutdown.
    #[error("Session '{session_id}' was closed: {reason}")]
    SessionClosed { session_id: String, reason: String },

    /// The inbound payload or session id is unusable.
    #[error("Invalid request: {details}")]
    InvalidRequest { details: String },
}

impl SessionError {
    /// Map this error to its JSON-RPC error code.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            Self::InvalidRequest { .. } => -32600,
            Self::SpawnFailure { .. } => -32010,
            Self::ProtocolFraming { .. } => -32011,
            Self::ChildCrashed { .. } => -32012,
            Self::CallTimeout { .. } => -32013,
            Self::SessionNotFound { .. } => -32014,
            Self::IdleEvicted { .. } => -32015,
            Self::SessionClosed { .. } => -32016,
        }
    }

    /// Machine-readable name used in `error.data.error_type` and metric labels.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::SpawnFailure { .. } => "spawn_failure",
            Self::ProtocolFraming { .. } => "protocol_framing",
            Self::ChildCrashed { .. } => "child_crashed",
            Self::CallTimeout { .. } => "call_timeout",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::IdleEvicted { .. } => "idle_evicted",
            Self::SessionClosed { .. } => "session_closed",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }

    /// HTTP status for transports that carry one (single-shot, DELETE).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::SessionNotFound { .. } => 404,
            Self::IdleEvicted { .. } => 410,
            Self::SpawnFailure { .. } | Self::ProtocolFraming { .. } | Self::ChildCrashed { .. } => {
                502
            }
            Self::SessionClosed { .. } => 503,
            Self::CallTimeout { .. } => 504,
        }
    }

    /// The session this error is scoped to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SpawnFailure { session_id, .. }
            | Self::ProtocolFraming { session_id, .. }
            | Self::ChildCrashed { session_id }
            | Self::CallTimeout { session_id, .. }
            | Self::SessionNotFound { session_id }
            | Self::IdleEvicted { session_id }
            | Self::SessionClosed { session_id, .. } => Some(session_id),
            Self::InvalidRequest { .. } => None,
        }
    }

    /// Details that are safe to return to the client.
    ///
    /// Spawn failure reasons stay in the logs; they can contain host paths.
    pub fn safe_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::CallTimeout { timeout_ms, .. } => {
                Some(serde_json::json!({ "timeout_ms": timeout_ms }))
            }
            Self::SessionClosed { reason, .. } => Some(serde_json::json!({ "reason": reason })),
            Self::InvalidRequest { details } => Some(serde_json::json!({ "reason": details })),
            Self::ProtocolFraming { .. }
            | Self::SpawnFailure { .. }
            | Self::ChildCrashed { .. }
            | Self::SessionNotFound { .. }
            | Self::IdleEvicted { .. } => None,
        }
    }

    /// Suggested retry delay in seconds.
    ///
    /// `Some(0)` means an immediate retry gets a fresh child.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ChildCrashed { .. }
            | Self::ProtocolFraming { .. }
            | Self::IdleEvicted { .. } => Some(0),
            Self::SpawnFailure { .. } => Some(1),
            _ => None,
        }
    }

    /// Build the JSON-RPC error object for this failure.
    pub fn to_jsonrpc_error(&self, correlation_id: &str) -> JsonRpcError {
        JsonRpcError {
            code: self.to_jsonrpc_code(),
            message: self.to_string(),
            data: Some(ErrorData {
                correlation_id: correlation_id.to_string(),
                error_type: self.error_type_name().to_string(),
                session_id: self.session_id().map(String::from),
                details: self.safe_details(),
                retry_after: self.retry_after(),
            }),
        }
    }

    /// Full JSON-RPC response envelope answering `id`.
    pub fn to_response(&self, id: Option<&JsonRpcId>, correlation_id: &str) -> serde_json::Value {
        self.to_jsonrpc_error(correlation_id).into_response(id)
    }
}

/// Errors produced while framing NDJSON messages.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A single NDJSON line exceeds the maximum size.
    #[error("Message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge {
        /// The configured maximum message size in bytes.
        max_bytes: usize,
    },

    /// The line is not valid JSON, or its structure is invalid for JSON-RPC.
    #[error("Malformed JSON: {reason}")]
    MalformedJson {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// The `jsonrpc` field is absent from the JSON object.
    #[error("Missing required jsonrpc field")]
    MissingVersion,

    /// The `jsonrpc` field is present but not `"2.0"`.
    #[error("Unsupported JSON-RPC version: {version}")]
    UnsupportedVersion {
        /// The version string found in the message.
        version: String,
    },

    /// The message is a JSON array (a JSON-RPC batch).
    #[error("JSON-RPC batch requests (arrays) are not supported")]
    UnsupportedBatch,

    /// An underlying IO error occurred while reading or writing the pipe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
