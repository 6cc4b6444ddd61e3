//! Persistent transport: a WebSocket bound to one session for its lifetime.
//!
//! Every inbound frame is dispatched on its own task, so a slow call never
//! blocks the next frame. Responses are matched to callers by call id inside
//! the child endpoint, not by arrival order.
//!
//! While the session's child is alive the socket also carries its unsolicited
//! traffic: notifications no call claimed and requests the child sends to the
//! client. The client answers those requests with ordinary response frames.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use sheetmux_core::session::{
    ChildEndpoint, ClosedSignal, Dispatcher, EvictionReason, Failure, ResponseSink, TransportKind,
};

use super::{AppState, parse_payload, session_header, set_session_header};
use crate::error::TransportError;

/// Outbound frames queued per connection.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub session_id: Option<String>,
}

struct FrameSink {
    tx: mpsc::Sender<Value>,
}

#[async_trait]
impl ResponseSink for FrameSink {
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

/// Unsolicited child traffic for the session a socket is bound to.
struct Feed {
    notes: broadcast::Receiver<Value>,
    closed: ClosedSignal,
}

impl Feed {
    fn attach(endpoint: &ChildEndpoint) -> Option<Self> {
        endpoint.is_alive().then(|| Self {
            notes: endpoint.subscribe(),
            closed: endpoint.closed_signal(),
        })
    }

    /// `None` once the child is gone.
    async fn next(&mut self) -> Option<Value> {
        loop {
            tokio::select! {
                biased;
                note = self.notes.recv() => match note {
                    Ok(note) => return Some(note),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "persistent client fell behind child notifications");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = self.closed.wait() => return None,
            }
        }
    }
}

/// Subscribe to the session's child. Only `spawn` may start one.
async fn attach(dispatcher: &Dispatcher, session_id: &str, spawn: bool) -> Option<Feed> {
    if !spawn {
        let record = dispatcher.table().record(session_id)?;
        return Feed::attach(record.endpoint());
    }
    match dispatcher.table().get_or_create(session_id).await {
        Ok(lease) => Feed::attach(lease.endpoint()),
        Err(error) => {
            // Dispatching the frame reports the same failure to the client.
            debug!(session_id, error = %error, "no child to attach to");
            None
        }
    }
}

async fn next_note(feed: &mut Option<Feed>) -> Option<Value> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

enum Inbound {
    Frame(Option<Result<Message, axum::Error>>),
    Note(Option<Value>),
}

/// `GET /ws/{*path}`
///
/// The session comes from `X-Session-ID`, then the `session_id` query
/// parameter, else it is minted. It is echoed on the upgrade response.
pub async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let hint = match session_header(&headers) {
        Ok(Some(id)) if !id.is_empty() => Some(id.to_string()),
        Ok(_) => params.session_id,
        Err(error) => return TransportError::from(error).into_response(),
    };
    let (session_id, minted) = match Dispatcher::resolve_session_id(hint.as_deref()) {
        Ok(resolved) => resolved,
        Err(error) => return TransportError::from(error).into_response(),
    };

    let connection_session = session_id.clone();
    let mut response = ws
        .on_upgrade(move |socket| run_connection(state, socket, connection_session, minted))
        .into_response();
    set_session_header(&mut response, &session_id);
    response
}

async fn run_connection(state: AppState, socket: WebSocket, session_id: String, minted: bool) {
    let Some(_guard) = state.lifecycle.track_request() else {
        return;
    };
    info!(session_id = %session_id, minted, "persistent connection opened");

    let (mut outbound, mut inbound) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if outbound
                .send(Message::Text(message.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = outbound.close().await;
    });

    let session_id: Arc<str> = Arc::from(session_id);
    let mut feed = attach(&state.dispatcher, &session_id, false).await;
    let mut calls = JoinSet::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => {
                debug!(session_id = %session_id, "closing persistent connection for shutdown");
                break;
            }
            Some(_) = calls.join_next(), if !calls.is_empty() => continue,
            note = next_note(&mut feed) => Inbound::Note(note),
            frame = inbound.next() => Inbound::Frame(frame),
        };

        let frame = match event {
            Inbound::Note(Some(note)) => {
                let _ = tx.send(note).await;
                continue;
            }
            Inbound::Note(None) => {
                debug!(session_id = %session_id, "child gone; detached from its notifications");
                feed = attach(&state.dispatcher, &session_id, false).await;
                continue;
            }
            Inbound::Frame(frame) => frame,
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => parse_payload(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => parse_payload(&bytes),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        match payload {
            Ok(payload) => {
                if feed.is_none() {
                    feed = attach(&state.dispatcher, &session_id, true).await;
                }
                let dispatcher = Arc::clone(&state.dispatcher);
                let session_id = Arc::clone(&session_id);
                let sink = FrameSink { tx: tx.clone() };
                calls.spawn(async move {
                    dispatcher
                        .handle(TransportKind::Persistent, &session_id, payload, &sink)
                        .await;
                });
            }
            Err(error) => {
                let _ = tx.send(Failure::new(error, None).to_response()).await;
            }
        }
    }

    drop(feed);
    calls.shutdown().await;
    if minted {
        let _ = state
            .dispatcher
            .close_session(&session_id, EvictionReason::ConnectionClosed)
            .await;
    }
    drop(tx);
    let _ = writer.await;
    info!(session_id = %session_id, "persistent connection closed");
}
