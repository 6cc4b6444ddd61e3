//! Routes inbound JSON-RPC messages to their session's child.
//!
//! Transports translate wire shape only. They hand each message to
//! [`Dispatcher::handle`] together with a [`ResponseSink`] that knows how to
//! write responses, progress chunks and failures back to the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SessionError;
use crate::framing::classify_value;
use crate::jsonrpc::{JsonRpcId, JsonRpcMessageKind, progress_token};
use crate::metrics::SheetmuxMetrics;
use crate::session::record::SessionLease;
use crate::session::table::{EvictionReason, SessionTable};

/// Longest client-supplied session id accepted.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Progress notifications queued per call before the child reader waits.
const PROGRESS_BUFFER: usize = 16;

/// The transport a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    SingleShot,
    Streamed,
    Persistent,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleShot => "single_shot",
            Self::Streamed => "streamed",
            Self::Persistent => "persistent",
        }
    }
}

/// What the dispatcher did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A response was delivered to the sink.
    Responded,
    /// A notification or client response was forwarded; nothing to deliver.
    Accepted,
    /// An error was delivered to the sink.
    Failed,
}

/// An error on its way back to the client.
#[derive(Debug, Clone)]
pub struct Failure {
    pub error: SessionError,
    /// Id of the request that failed, when one could be read.
    pub id: Option<JsonRpcId>,
    pub correlation_id: String,
}

impl Failure {
    pub fn new(error: SessionError, id: Option<JsonRpcId>) -> Self {
        Self {
            error,
            id,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// JSON-RPC error response for the client.
    pub fn to_response(&self) -> Value {
        self.error.to_response(self.id.as_ref(), &self.correlation_id)
    }
}

/// Where a transport wants the outcome of one message written.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Streamed transports return `true` to receive progress notifications.
    fn wants_progress(&self) -> bool {
        false
    }

    /// One intermediate message for the call, in emission order.
    async fn chunk(&self, _message: Value) {}

    /// The call's response.
    async fn deliver(&self, response: Value);

    async fn fail(&self, failure: Failure);
}

/// Shared entry point for every transport.
pub struct Dispatcher {
    table: Arc<SessionTable>,
    call_timeout: Option<Duration>,
    metrics: Option<Arc<SheetmuxMetrics>>,
}

impl Dispatcher {
    pub fn new(
        table: Arc<SessionTable>,
        call_timeout: Option<Duration>,
        metrics: Option<Arc<SheetmuxMetrics>>,
    ) -> Self {
        Self {
            table,
            call_timeout,
            metrics,
        }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Accept a client-supplied session id or mint a new one.
    ///
    /// Returns the id and whether it was minted. An absent or empty hint
    /// mints a UUID v4.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the hint is longer than 128 bytes or contains
    /// anything but visible ASCII.
    pub fn resolve_session_id(hint: Option<&str>) -> Result<(String, bool), SessionError> {
        match hint {
            None | Some("") => Ok((Uuid::new_v4().to_string(), true)),
            Some(id)
                if id.len() <= MAX_SESSION_ID_LEN && id.bytes().all(|b| b.is_ascii_graphic()) =>
            {
                Ok((id.to_string(), false))
            }
            Some(_) => Err(SessionError::InvalidRequest {
                details: format!(
                    "session id must be 1 to {MAX_SESSION_ID_LEN} visible ASCII characters"
                ),
            }),
        }
    }

    /// Dispatch one inbound message for `session_id`.
    ///
    /// Exactly one of `sink.deliver` or `sink.fail` is called for requests.
    /// For notifications and client responses only `sink.fail` may be called.
    pub async fn handle(
        &self,
        transport: TransportKind,
        session_id: &str,
        payload: Value,
        sink: &dyn ResponseSink,
    ) -> Dispatched {
        let started = Instant::now();
        let (outcome, dispatched) = self.route(session_id, payload, sink).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_call(
                transport.as_str(),
                outcome,
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        tracing::debug!(
            session_id,
            transport = transport.as_str(),
            outcome,
            duration_ms = started.elapsed().as_millis() as u64,
            "call dispatched"
        );
        dispatched
    }

    /// Terminate a session on client request.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the id has no session.
    pub async fn close_session(
        &self,
        session_id: &str,
        reason: EvictionReason,
    ) -> Result<(), SessionError> {
        if self.table.evict(session_id, reason).await {
            Ok(())
        } else {
            Err(SessionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
        }
    }

    async fn route(
        &self,
        session_id: &str,
        payload: Value,
        sink: &dyn ResponseSink,
    ) -> (&'static str, Dispatched) {
        let id_hint = payload
            .get("id")
            .and_then(|id| serde_json::from_value::<JsonRpcId>(id.clone()).ok());

        let message = match classify_value(payload) {
            Ok(message) => message,
            Err(e) => {
                let error = SessionError::InvalidRequest {
                    details: e.to_string(),
                };
                return self.fail(None, error, id_hint, sink).await;
            }
        };

        let lease = match self.table.get_or_create(session_id).await {
            Ok(lease) => lease,
            Err(error) => {
                let id = message.kind.id().cloned();
                return self.fail(None, error, id, sink).await;
            }
        };

        match message.kind {
            JsonRpcMessageKind::Request { id, method } => {
                tracing::trace!(session_id, method = %method, "forwarding request");
                self.forward_call(&lease, id, message.value, sink).await
            }
            JsonRpcMessageKind::Notification { .. } | JsonRpcMessageKind::Response { .. } => {
                match lease.endpoint().send_notification(&message.value).await {
                    Ok(()) => {
                        self.table.touch(session_id);
                        ("accepted", Dispatched::Accepted)
                    }
                    Err(error) => self.fail(Some(&lease), error, None, sink).await,
                }
            }
        }
    }

    async fn forward_call(
        &self,
        lease: &SessionLease,
        id: JsonRpcId,
        request: Value,
        sink: &dyn ResponseSink,
    ) -> (&'static str, Dispatched) {
        let endpoint = lease.endpoint();
        let streams_progress = sink.wants_progress() && progress_token(&request).is_some();

        let result = if streams_progress {
            let (tx, mut notes) = mpsc::channel(PROGRESS_BUFFER);
            let call = endpoint.call_with_progress(&id, &request, self.call_timeout, tx);
            tokio::pin!(call);

            let result = loop {
                tokio::select! {
                    biased;
                    note = notes.recv() => match note {
                        Some(note) => sink.chunk(note).await,
                        None => break (&mut call).await,
                    },
                    result = &mut call => break result,
                }
            };

            // Progress the child wrote before its response is already queued.
            while let Ok(note) = notes.try_recv() {
                sink.chunk(note).await;
            }
            result
        } else {
            endpoint.call(&id, &request, self.call_timeout).await
        };

        match result {
            Ok(response) => {
                self.table.touch(lease.session_id());
                sink.deliver(response).await;
                ("success", Dispatched::Responded)
            }
            Err(error) => self.fail(Some(lease), error, Some(id), sink).await,
        }
    }

    async fn fail(
        &self,
        lease: Option<&SessionLease>,
        error: SessionError,
        id: Option<JsonRpcId>,
        sink: &dyn ResponseSink,
    ) -> (&'static str, Dispatched) {
        if let Some(lease) = lease {
            let reason = match &error {
                SessionError::ChildCrashed { .. } => Some(EvictionReason::Crashed),
                SessionError::ProtocolFraming { .. } => Some(EvictionReason::Framing),
                _ => None,
            };
            if let Some(reason) = reason {
                self.table
                    .evict_generation(lease.session_id(), lease.generation(), reason)
                    .await;
            }
        }

        let outcome = error.error_type_name();
        let failure = Failure::new(error, id);
        tracing::warn!(
            correlation_id = %failure.correlation_id,
            session_id = failure.error.session_id(),
            error_type = outcome,
            error = %failure.error,
            "call failed"
        );
        sink.fail(failure).await;
        (outcome, Dispatched::Failed)
    }
}
