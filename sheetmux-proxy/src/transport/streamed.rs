//! Streamed transport: one call per request, answered as Server-Sent Events.
//!
//! Progress notifications for the call arrive as `message` events, followed
//! by one `message` event with the response or error and a final `end`.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::mpsc;

use sheetmux_core::session::{Dispatcher, Failure, ResponseSink, TransportKind};

use super::{AppState, parse_payload, session_header, set_session_header};
use crate::error::TransportError;

/// Buffered events per call before the dispatcher waits on the client.
const EVENT_BUFFER: usize = 32;

struct SseSink {
    tx: mpsc::Sender<Value>,
}

#[async_trait]
impl ResponseSink for SseSink {
    fn wants_progress(&self) -> bool {
        true
    }

    async fn chunk(&self, message: Value) {
        let _ = self.tx.send(message).await;
    }

    async fn deliver(&self, response: Value) {
        let _ = self.tx.send(response).await;
    }

    async fn fail(&self, failure: Failure) {
        let _ = self.tx.send(failure.to_response()).await;
    }
}

/// `POST /stream/{*path}`
pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let session_id = match session_header(&headers).and_then(Dispatcher::resolve_session_id) {
        Ok((session_id, _minted)) => session_id,
        Err(error) => return TransportError::from(error).into_response(),
    };

    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(error) => {
            let mut response = TransportError::from(error).into_response();
            set_session_header(&mut response, &session_id);
            return response;
        }
    };

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let guard = state.lifecycle.track_request();
    let dispatcher = state.dispatcher.clone();
    let call_session = session_id.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let sink = SseSink { tx };
        dispatcher
            .handle(TransportKind::Streamed, &call_session, payload, &sink)
            .await;
    });

    let mut response = Sse::new(event_stream(rx))
        .keep_alive(KeepAlive::default())
        .into_response();
    set_session_header(&mut response, &session_id);
    response
}

/// Relay sink messages as `message` events, then close with `end`.
fn event_stream(rx: mpsc::Receiver<Value>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        match rx.recv().await {
            Some(message) => {
                let event = Event::default().event("message").data(message.to_string());
                Some((Ok(event), Some(rx)))
            }
            None => Some((Ok(Event::default().event("end").data("")), None)),
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::test_util::state_with_shell_child;
    use super::super::{SESSION_HEADER, router};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Emits two progress notifications for token "t", then the response.
    const PROGRESS_CHILD: &str = r#"while read -r line; do
echo '{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":"t","progress":1}}'
echo '{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":"other","progress":1}}'
echo '{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":"t","progress":2}}'
echo '{"jsonrpc":"2.0","id":7,"result":{"done":true}}'
done"#;

    fn events(body: &str) -> Vec<(String, String)> {
        body.split("\n\n")
            .filter_map(|block| {
                let mut name = None;
                let mut data = String::new();
                for line in block.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        name = Some(v.trim().to_string());
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push_str(v.trim());
                    }
                }
                name.map(|n| (n, data))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_progress_then_response_then_end() {
        let state = state_with_shell_child(PROGRESS_CHILD);
        let request = Request::builder()
            .method("POST")
            .uri("/stream/mcp")
            .header(&SESSION_HEADER, "sse-1")
            .body(Body::from(
                r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"_meta":{"progressToken":"t"}}}"#,
            ))
            .unwrap();

        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&SESSION_HEADER], "sse-1");
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let events = events(&String::from_utf8_lossy(&body));
        assert_eq!(events.len(), 4, "{events:?}");

        let progress: Vec<serde_json::Value> = events[..2]
            .iter()
            .map(|(name, data)| {
                assert_eq!(name, "message");
                serde_json::from_str(data).unwrap()
            })
            .collect();
        assert_eq!(progress[0]["params"]["progress"], 1);
        assert_eq!(progress[1]["params"]["progress"], 2);

        let (name, data) = &events[2];
        assert_eq!(name, "message");
        let response: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(response["result"]["done"], true);
        assert_eq!(events[3].0, "end");

        state.dispatcher.table().shutdown().await;
    }

    #[tokio::test]
    async fn test_error_is_streamed_as_message() {
        let state = state_with_shell_child("exit 0");
        let request = Request::builder()
            .method("POST")
            .uri("/stream/mcp")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();

        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let events = events(&String::from_utf8_lossy(&body));
        assert_eq!(events.len(), 2, "{events:?}");
        let error: serde_json::Value = serde_json::from_str(&events[0].1).unwrap();
        assert_eq!(error["error"]["data"]["error_type"], "child_crashed");
        assert_eq!(events[1].0, "end");
    }
}
