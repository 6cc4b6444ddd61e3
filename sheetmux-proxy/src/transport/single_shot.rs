//! Single-shot transport: one JSON-RPC message per HTTP request.

use async_trait::async_trait;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tokio::sync::Mutex;

use sheetmux_core::error::SessionError;
use sheetmux_core::session::{
    Dispatcher, EvictionReason, Failure, ResponseSink, TransportKind,
};

use super::{AppState, parse_payload, session_header, set_session_header};
use crate::error::TransportError;

enum Outcome {
    Response(Value),
    Failure(Failure),
}

/// Holds the one outcome of a single-shot call until the handler renders it.
#[derive(Default)]
struct OneShotSink {
    outcome: Mutex<Option<Outcome>>,
}

#[async_trait]
impl ResponseSink for OneShotSink {
    async fn deliver(&self, response: Value) {
        *self.outcome.lock().await = Some(Outcome::Response(response));
    }

    async fn fail(&self, failure: Failure) {
        *self.outcome.lock().await = Some(Outcome::Failure(failure));
    }
}

/// `POST /{*path}`
///
/// Responds 200 with the child's JSON-RPC response, 202 for notifications
/// and client responses, or the error's status with a JSON-RPC error body.
/// The session id is always echoed in `X-Session-ID` once resolved.
pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let session_id = match session_header(&headers)
        .and_then(Dispatcher::resolve_session_id)
    {
        Ok((session_id, _minted)) => session_id,
        Err(error) => return TransportError::from(error).into_response(),
    };

    let mut response = match parse_payload(&body) {
        Ok(payload) => {
            let sink = OneShotSink::default();
            state
                .dispatcher
                .handle(TransportKind::SingleShot, &session_id, payload, &sink)
                .await;
            render(sink.outcome.into_inner())
        }
        Err(error) => TransportError::from(error).into_response(),
    };
    set_session_header(&mut response, &session_id);
    response
}

fn render(outcome: Option<Outcome>) -> Response {
    match outcome {
        Some(Outcome::Response(response)) => (StatusCode::OK, Json(response)).into_response(),
        Some(Outcome::Failure(failure)) => TransportError::Session(failure).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// `DELETE /{*path}`
///
/// Terminates the session named by `X-Session-ID` through the same eviction
/// path the reaper uses. 204 on success, 404 if the id is unknown.
pub async fn terminate(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session_id = match session_header(&headers) {
        Ok(Some(id)) if !id.is_empty() => id.to_string(),
        Ok(_) => {
            return TransportError::from(SessionError::InvalidRequest {
                details: "X-Session-ID header is required".to_string(),
            })
            .into_response();
        }
        Err(error) => return TransportError::from(error).into_response(),
    };

    match state
        .dispatcher
        .close_session(&session_id, EvictionReason::Explicit)
        .await
    {
        Ok(()) => {
            tracing::info!(session_id = %session_id, "session terminated by client");
            let mut response = StatusCode::NO_CONTENT.into_response();
            set_session_header(&mut response, &session_id);
            response
        }
        Err(error) => TransportError::from(error).into_response(),
    }
}
