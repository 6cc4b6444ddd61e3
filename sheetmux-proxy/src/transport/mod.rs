//! Client-facing transports.
//!
//! | Route | Transport |
//! |-------|-----------|
//! | `POST /stream/{*path}` | streamed (SSE) |
//! | `GET /ws/{*path}` | persistent (WebSocket) |
//! | `POST /{*path}` | single-shot JSON |
//! | `DELETE /{*path}` | explicit session termination |
//!
//! Each adapter only translates wire shape; routing, idle tracking and error
//! mapping live in the core [`Dispatcher`].

pub mod persistent;
pub mod single_shot;
pub mod streamed;

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;

use sheetmux_core::error::SessionError;
use sheetmux_core::framing::MAX_MESSAGE_BYTES;
use sheetmux_core::lifecycle::LifecycleManager;
use sheetmux_core::session::Dispatcher;

use crate::error::TransportError;

/// Header carrying the session id in both directions.
pub static SESSION_HEADER: HeaderName = HeaderName::from_static("x-session-id");

/// State shared by every transport handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<LifecycleManager>,
    /// Cancelled when the proxy begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, lifecycle: Arc<LifecycleManager>) -> Self {
        let shutdown = lifecycle.shutdown_token();
        Self {
            dispatcher,
            lifecycle,
            shutdown,
        }
    }
}

/// Build the client-facing router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{*path}", get(persistent::upgrade))
        .route("/stream/{*path}", post(streamed::handle))
        .route(
            "/{*path}",
            post(single_shot::handle).delete(single_shot::terminate),
        )
        .layer(middleware::from_fn_with_state(state.clone(), track_lifecycle))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_BYTES))
        .with_state(state)
}

/// Count the request for draining, or refuse it with 503 once shutdown began.
async fn track_lifecycle(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(_guard) = state.lifecycle.track_request() else {
        return TransportError::ShuttingDown.into_response();
    };
    next.run(request).await
}

/// Read the raw `X-Session-ID` header.
///
/// # Errors
///
/// `InvalidRequest` if the header is not visible ASCII.
pub(crate) fn session_header(headers: &HeaderMap) -> Result<Option<&str>, SessionError> {
    headers
        .get(&SESSION_HEADER)
        .map(|value| {
            value.to_str().map_err(|_| SessionError::InvalidRequest {
                details: "X-Session-ID header is not visible ASCII".to_string(),
            })
        })
        .transpose()
}

/// Echo the session id back to the client.
pub(crate) fn set_session_header(response: &mut Response, session_id: &str) {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER.clone(), value);
    }
}

/// Parse one inbound JSON-RPC payload.
pub(crate) fn parse_payload(bytes: &[u8]) -> Result<serde_json::Value, SessionError> {
    serde_json::from_slice(bytes).map_err(|e| SessionError::InvalidRequest {
        details: format!("payload is not valid JSON: {e}"),
    })
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_session_header_rejects_non_ascii() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SESSION_HEADER.clone(),
            HeaderValue::from_bytes("s\u{e9}".as_bytes()).unwrap(),
        );
        assert!(matches!(
            session_header(&headers),
            Err(SessionError::InvalidRequest { .. })
        ));

        headers.insert(SESSION_HEADER.clone(), HeaderValue::from_static("abc"));
        assert_eq!(session_header(&headers).unwrap(), Some("abc"));
        assert_eq!(session_header(&HeaderMap::new()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_new_calls_during_shutdown() {
        let state = state_with_shell_child(ECHO_ONE);
        state.lifecycle.begin_shutdown();
        let app = router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/mcp")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
