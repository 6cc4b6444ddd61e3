//! HTTP rendering of proxy failures.
//!
//! Every failure is answered with a JSON-RPC error object. Transports that
//! carry an HTTP status use [`SessionError::http_status`].

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use uuid::Uuid;

use sheetmux_core::error::{ErrorData, JsonRpcError, SessionError};
use sheetmux_core::session::Failure;

/// Errors a transport handler returns to its client.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A call failed, or its input was rejected before dispatch.
    #[error("{}", .0.error)]
    Session(Failure),

    /// The proxy is draining and takes no new calls (maps to 503).
    #[error("Proxy is shutting down")]
    ShuttingDown,
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Session(failure) => StatusCode::from_u16(failure.error.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// JSON-RPC error envelope for the body.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            Self::Session(failure) => failure.to_response(),
            Self::ShuttingDown => JsonRpcError {
                code: -32016,
                message: self.to_string(),
                data: Some(ErrorData {
                    correlation_id: Uuid::new_v4().to_string(),
                    error_type: "session_closed".to_string(),
                    session_id: None,
                    details: Some(serde_json::json!({ "reason": "proxy shutting down" })),
                    retry_after: None,
                }),
            }
            .into_response(None),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Session(failure) => failure.error.retry_after(),
            Self::ShuttingDown => None,
        }
    }
}

impl From<SessionError> for TransportError {
    fn from(error: SessionError) -> Self {
        Self::Session(Failure::new(error, None))
    }
}

impl From<Failure> for TransportError {
    fn from(failure: Failure) -> Self {
        Self::Session(failure)
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.to_body())).into_response();
        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
