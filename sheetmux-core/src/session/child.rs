//! Proxy-side handle to one running tool server.
//!
//! A [`ChildEndpoint`] owns the child's stdin writer, a reader task over its
//! stdout, and the table of pending response slots.
//!
//! # Correlation
//!
//! Each request is written with a wire id unique to this endpoint, and the
//! client's own id is put back on the response. A response that arrives after
//! its caller gave up matches no slot and is dropped, even when a newer call
//! reuses the client id. Progress notifications carrying a call's
//! `progressToken` go to that call's channel in emission order. Anything else
//! the child sends on its own goes to subscribers of
//! [`ChildEndpoint::subscribe`].
//!
//! # Closing
//!
//! The endpoint closes exactly once, for the first cause reported:
//! stdout EOF or a read error (`ChildCrashed`), malformed output
//! (`ProtocolFraming`), or an explicit [`ChildEndpoint::terminate`]. Closing
//! fails every pending slot with that cause and stops the reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{FramingError, SessionError};
use crate::framing::{MAX_MESSAGE_BYTES, bounded_read_line, encode_line, parse_message};
use crate::jsonrpc::{JsonRpcId, JsonRpcMessageKind, progress_token};
use crate::session::launcher::ChildIo;
use crate::session::shutdown::{ShutdownRequest, shutdown_child};

/// Unsolicited child messages buffered per subscriber before it starts lagging.
const NOTIFICATION_CAPACITY: usize = 64;

/// JSON-RPC "method not found", used to refuse child requests nobody can answer.
const METHOD_NOT_FOUND: i32 = -32601;

const PROGRESS_METHOD: &str = "notifications/progress";
const CANCELLED_METHOD: &str = "notifications/cancelled";

type SlotResult = Result<Value, SessionError>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-endpoint tuning.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Requests written to the child before waiting for a response.
    /// `1` means strictly one request at a time.
    pub max_in_flight: usize,
    pub shutdown: ShutdownRequest,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            shutdown: ShutdownRequest::default(),
        }
    }
}

struct PendingSlot {
    client_id: JsonRpcId,
    tx: oneshot::Sender<SlotResult>,
}

struct ProgressRoute {
    wire_id: u64,
    tx: mpsc::Sender<Value>,
}

/// State shared between the endpoint and its reader task.
struct Shared {
    session_id: String,
    writer: Mutex<Option<Writer>>,
    /// Keyed by wire id.
    pending: DashMap<u64, PendingSlot>,
    /// Client correlation key to wire id, for calls still waiting.
    client_ids: DashMap<String, u64>,
    /// Progress token key to the owning call's channel.
    progress: DashMap<String, ProgressRoute>,
    next_wire_id: AtomicU64,
    notifications: broadcast::Sender<Value>,
    in_flight: Semaphore,
    closed: CancellationToken,
    cause: OnceLock<SessionError>,
}

impl Shared {
    fn cause(&self) -> SessionError {
        self.cause
            .get()
            .cloned()
            .unwrap_or_else(|| SessionError::ChildCrashed {
                session_id: self.session_id.clone(),
            })
    }

    /// Close the endpoint. Returns `false` if it was already closed.
    fn close(&self, cause: SessionError) -> bool {
        let first = self.cause.set(cause).is_ok();
        self.closed.cancel();
        self.in_flight.close();

        let cause = self.cause();
        let wire_ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for wire_id in wire_ids {
            if let Some((_, slot)) = self.pending.remove(&wire_id) {
                let _ = slot.tx.send(Err(cause.clone()));
            }
        }
        self.progress.clear();
        first
    }

    fn register(
        &self,
        client_id: &JsonRpcId,
        progress: Option<(String, mpsc::Sender<Value>)>,
    ) -> Result<Registration<'_>, SessionError> {
        if self.closed.is_cancelled() {
            return Err(self.cause());
        }

        let client_key = client_id.correlation_key();
        let wire_id = self.next_wire_id.fetch_add(1, Ordering::Relaxed);
        match self.client_ids.entry(client_key.clone()) {
            Entry::Occupied(_) => {
                return Err(SessionError::InvalidRequest {
                    details: format!("request id {client_id} is already in flight on this session"),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(wire_id);
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            wire_id,
            PendingSlot {
                client_id: client_id.clone(),
                tx,
            },
        );

        let mut token_key = None;
        if let Some((key, tx)) = progress {
            match self.progress.entry(key.clone()) {
                Entry::Occupied(_) => {
                    tracing::debug!(session_id = %self.session_id, token = %key, "progress token already routed to another call");
                }
                Entry::Vacant(entry) => {
                    entry.insert(ProgressRoute { wire_id, tx });
                    token_key = Some(key);
                }
            }
        }

        let registration = Registration {
            shared: self,
            wire_id,
            client_key,
            token_key,
            rx: Some(rx),
        };

        // close() may have drained the maps just before the inserts.
        if self.closed.is_cancelled() {
            return Err(self.cause());
        }
        Ok(registration)
    }

    /// Point a client's `notifications/cancelled` at the wire id in use.
    fn translate_cancellation(&self, message: &Value) -> Option<Value> {
        if message.get("method").and_then(Value::as_str) != Some(CANCELLED_METHOD) {
            return None;
        }
        let request_id = message.get("params")?.get("requestId")?;
        let client_id = serde_json::from_value::<JsonRpcId>(request_id.clone()).ok()?;
        let wire_id = *self.client_ids.get(&client_id.correlation_key())?;

        let mut translated = message.clone();
        translated
            .get_mut("params")?
            .as_object_mut()?
            .insert("requestId".to_string(), json!(wire_id));
        Some(translated)
    }

    async fn write_line(&self, message: &Value) -> Result<(), SessionError> {
        let line = encode_line(message).map_err(|e| SessionError::InvalidRequest {
            details: e.to_string(),
        })?;

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.cause()),
            result = self.write_locked(&line) => result,
        };

        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.cause()),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "write to child stdin failed");
                self.close(SessionError::ChildCrashed {
                    session_id: self.session_id.clone(),
                });
                Err(self.cause())
            }
        }
    }

    /// Returns `Ok(false)` when stdin has already been closed.
    async fn write_locked(&self, line: &[u8]) -> std::io::Result<bool> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(false);
        };
        writer.write_all(line).await?;
        writer.flush().await?;
        Ok(true)
    }
}

/// One call's entries in the correlation maps. Dropping it releases them,
/// whether the call finished or was abandoned.
struct Registration<'a> {
    shared: &'a Shared,
    wire_id: u64,
    client_key: String,
    token_key: Option<String>,
    rx: Option<oneshot::Receiver<SlotResult>>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let wire_id = self.wire_id;
        self.shared.pending.remove(&wire_id);
        self.shared
            .client_ids
            .remove_if(&self.client_key, |_, owner| *owner == wire_id);
        if let Some(key) = &self.token_key {
            self.shared
                .progress
                .remove_if(key, |_, route| route.wire_id == wire_id);
        }
    }
}

/// Key under which a progress token is routed. JSON text keeps `1` and `"1"` apart.
fn token_key(token: &Value) -> String {
    token.to_string()
}

/// `message` with its `id` member replaced.
fn with_id(message: &Value, id: Value) -> Value {
    let mut message = message.clone();
    if let Some(object) = message.as_object_mut() {
        object.insert("id".to_string(), id);
    }
    message
}

/// Resolves once the endpoint has closed, yielding the cause.
#[derive(Clone)]
pub struct ClosedSignal {
    shared: Arc<Shared>,
}

impl ClosedSignal {
    pub async fn wait(&self) -> SessionError {
        self.shared.closed.cancelled().await;
        self.shared.cause()
    }
}

/// One running tool server and its pipes.
pub struct ChildEndpoint {
    shared: Arc<Shared>,
    process: std::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    shutdown: ShutdownRequest,
}

impl ChildEndpoint {
    /// Take ownership of a launched child and start reading its output.
    pub fn start(session_id: &str, io: ChildIo, options: EndpointOptions) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let shared = Arc::new(Shared {
            session_id: session_id.to_string(),
            writer: Mutex::new(Some(io.stdin)),
            pending: DashMap::new(),
            client_ids: DashMap::new(),
            progress: DashMap::new(),
            next_wire_id: AtomicU64::new(1),
            notifications,
            in_flight: Semaphore::new(options.max_in_flight.max(1)),
            closed: CancellationToken::new(),
            cause: OnceLock::new(),
        });

        tokio::spawn(read_loop(Arc::clone(&shared), io.stdout));

        let pid = io.process.as_ref().and_then(Child::id);
        Arc::new(Self {
            shared,
            process: std::sync::Mutex::new(io.process),
            pid,
            shutdown: options.shutdown,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// OS process id, if the child is an OS process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` bounds the whole exchange, including the wait for an
    /// in-flight permit. A timed-out call leaves the child running; its late
    /// response is dropped.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if `id` is already in flight on this endpoint
    /// - `CallTimeout` if no response arrives within `timeout`
    /// - the close cause (`ChildCrashed`, `ProtocolFraming`, ...) if the
    ///   endpoint closes before the response arrives
    pub async fn call(
        &self,
        id: &JsonRpcId,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        self.exchange(id, request, timeout, None).await
    }

    /// Like [`call`](Self::call), and also sends every progress notification
    /// for the request's `params._meta.progressToken` to `progress`.
    ///
    /// The reader waits for room in `progress`, so notifications are never
    /// skipped. All of them are queued before the call returns.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub async fn call_with_progress(
        &self,
        id: &JsonRpcId,
        request: &Value,
        timeout: Option<Duration>,
        progress: mpsc::Sender<Value>,
    ) -> Result<Value, SessionError> {
        let route = progress_token(request).map(|token| (token_key(token), progress));
        self.exchange(id, request, timeout, route).await
    }

    async fn exchange(
        &self,
        id: &JsonRpcId,
        request: &Value,
        timeout: Option<Duration>,
        progress: Option<(String, mpsc::Sender<Value>)>,
    ) -> Result<Value, SessionError> {
        let shared = &self.shared;
        let mut registration = shared.register(id, progress)?;
        let wire_request = with_id(request, json!(registration.wire_id));
        let rx = registration.rx.take();

        let exchange = async {
            let _permit = shared
                .in_flight
                .acquire()
                .await
                .map_err(|_| shared.cause())?;
            shared.write_line(&wire_request).await?;
            match rx {
                Some(rx) => rx.await.unwrap_or_else(|_| Err(shared.cause())),
                None => Err(shared.cause()),
            }
        };

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.unwrap_or_else(|_| {
                tracing::warn!(
                    session_id = %shared.session_id,
                    request_id = %id,
                    wire_id = registration.wire_id,
                    timeout_ms = limit.as_millis() as u64,
                    "call timed out, child left running"
                );
                Err(SessionError::CallTimeout {
                    session_id: shared.session_id.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
            None => exchange.await,
        };
        drop(registration);
        result
    }

    /// Write a message that expects no response (notification or client response).
    ///
    /// A `notifications/cancelled` naming a call still in flight is rewritten
    /// to that call's wire id.
    pub async fn send_notification(&self, message: &Value) -> Result<(), SessionError> {
        match self.shared.translate_cancellation(message) {
            Some(translated) => self.shared.write_line(&translated).await,
            None => self.shared.write_line(message).await,
        }
    }

    /// Receive what the child sends on its own from now on: notifications not
    /// claimed by a call's progress channel, and requests.
    ///
    /// Requests from the child are refused with "method not found" only while
    /// nobody is subscribed; a subscriber is expected to answer them through
    /// [`send_notification`](Self::send_notification).
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.shared.notifications.subscribe()
    }

    /// True while the endpoint is open and its process has not exited.
    pub fn is_alive(&self) -> bool {
        if self.shared.closed.is_cancelled() {
            return false;
        }
        let mut process = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The reason the endpoint closed, if it has.
    pub fn close_cause(&self) -> Option<SessionError> {
        self.shared.cause.get().cloned()
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Fail pending calls with `cause`, close stdin and stop the process.
    ///
    /// Idempotent. Later calls return immediately; the first cause wins.
    pub async fn terminate(&self, cause: SessionError) {
        self.shared.close(cause);
        drop(self.shared.writer.lock().await.take());

        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = process else {
            return;
        };

        match shutdown_child(&self.shared.session_id, &mut child, &self.shutdown).await {
            Ok(code) => {
                tracing::debug!(session_id = %self.shared.session_id, pid = self.pid, code, "child stopped");
            }
            // Already gone counts as stopped.
            Err(e) => {
                tracing::warn!(session_id = %self.shared.session_id, pid = self.pid, error = %e, "child stop reported an error");
            }
        }
    }
}

impl Drop for ChildEndpoint {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

async fn read_loop(shared: Arc<Shared>, stdout: Box<dyn AsyncRead + Send + Unpin>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::with_capacity(4096);
    let session_id = shared.session_id.clone();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => return,
            read = bounded_read_line(&mut reader, &mut buf, MAX_MESSAGE_BYTES) => read,
        };

        match read {
            Ok(0) => {
                if shared.close(SessionError::ChildCrashed {
                    session_id: session_id.clone(),
                }) {
                    tracing::warn!(session_id = %session_id, "child closed stdout");
                }
                return;
            }
            Ok(_) => {}
            Err(FramingError::Io(e)) => {
                if shared.close(SessionError::ChildCrashed {
                    session_id: session_id.clone(),
                }) {
                    tracing::warn!(session_id = %session_id, error = %e, "reading child stdout failed");
                }
                return;
            }
            Err(e) => {
                close_for_framing(&shared, e.to_string());
                return;
            }
        }

        let Ok(line) = std::str::from_utf8(&buf) else {
            close_for_framing(&shared, "child output is not valid UTF-8".to_string());
            return;
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match parse_message(line) {
            Ok(message) => message,
            Err(e) => {
                close_for_framing(&shared, e.to_string());
                return;
            }
        };

        match message.kind {
            JsonRpcMessageKind::Response { id } => {
                let slot = match &id {
                    JsonRpcId::Number(n) => u64::try_from(*n)
                        .ok()
                        .and_then(|wire_id| shared.pending.remove(&wire_id)),
                    _ => None,
                };
                match slot {
                    Some((_, slot)) => {
                        let response = with_id(&message.value, slot.client_id.to_value());
                        let _ = slot.tx.send(Ok(response));
                    }
                    None => {
                        tracing::debug!(session_id = %session_id, response_id = %id, "dropping response with no waiting caller");
                    }
                }
            }
            JsonRpcMessageKind::Notification { method } => {
                tracing::trace!(session_id = %session_id, method = %method, "child notification");
                let unclaimed = if method == PROGRESS_METHOD {
                    match route_progress(&shared, message.value).await {
                        Routed::Delivered => None,
                        Routed::Unclaimed(value) => Some(value),
                        Routed::Closed => return,
                    }
                } else {
                    Some(message.value)
                };
                if let Some(value) = unclaimed {
                    let _ = shared.notifications.send(value);
                }
            }
            JsonRpcMessageKind::Request { id, method } => {
                if shared.notifications.send(message.value).is_err() {
                    tracing::debug!(session_id = %session_id, method = %method, "refusing request from child, no client attached");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": id.to_value(),
                            "error": {
                                "code": METHOD_NOT_FOUND,
                                "message": format!("Method '{method}' has no client to answer it"),
                            },
                        });
                        let _ = shared.write_line(&reply).await;
                    });
                }
            }
        }
    }
}

enum Routed {
    Delivered,
    Unclaimed(Value),
    Closed,
}

/// Hand a progress notification to the call that owns its token.
///
/// Waits for room in the call's channel, so a slow consumer slows the reader
/// instead of losing notifications.
async fn route_progress(shared: &Shared, note: Value) -> Routed {
    let route = note
        .get("params")
        .and_then(|p| p.get("progressToken"))
        .and_then(|token| shared.progress.get(&token_key(token)))
        .map(|route| route.tx.clone());
    let Some(tx) = route else {
        return Routed::Unclaimed(note);
    };

    tokio::select! {
        biased;
        _ = shared.closed.cancelled() => Routed::Closed,
        sent = tx.send(note) => match sent {
            Ok(()) => Routed::Delivered,
            // The call finished while the notification was in transit.
            Err(mpsc::error::SendError(note)) => Routed::Unclaimed(note),
        },
    }
}

fn close_for_framing(shared: &Shared, reason: String) {
    tracing::warn!(session_id = %shared.session_id, reason = %reason, "child broke protocol framing");
    shared.close(SessionError::ProtocolFraming {
        session_id: shared.session_id.clone(),
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::spawn_scripted_child;

    fn request(id: Value, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    fn start(max_in_flight: usize) -> (Arc<ChildEndpoint>, crate::session::test_support::FakeChildHandle) {
        let (io, handle) = spawn_scripted_child(1);
        let endpoint = ChildEndpoint::start(
            "s",
            io,
            EndpointOptions {
                max_in_flight,
                ..Default::default()
            },
        );
        (endpoint, handle)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (endpoint, _child) = start(1);
        let id = JsonRpcId::Number(1);
        let response = endpoint
            .call(&id, &request(json!(1), "ping", json!({})), None)
            .await
            .unwrap();
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"], json!({}));
        assert!(endpoint.is_alive());
        assert_eq!(endpoint.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (endpoint, _child) = start(2);
        let slow = request(json!("A"), "sleep", json!({"ms": 150}));
        let fast = request(json!("B"), "sleep", json!({"ms": 10}));
        let id_a = JsonRpcId::String("A".into());
        let id_b = JsonRpcId::String("B".into());

        let (a, b) = tokio::join!(
            endpoint.call(&id_a, &slow, None),
            endpoint.call(&id_b, &fast, None)
        );
        assert_eq!(a.unwrap()["id"], json!("A"));
        assert_eq!(b.unwrap()["id"], json!("B"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_first_call_unaffected() {
        let (endpoint, _child) = start(2);
        let id = JsonRpcId::Number(7);
        let first = request(json!(7), "sleep", json!({"ms": 100}));

        let (a, b) = tokio::join!(endpoint.call(&id, &first, None), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            endpoint.call(&id, &request(json!(7), "ping", json!({})), None).await
        });
        assert!(a.is_ok());
        assert!(matches!(b, Err(SessionError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_timeout_keeps_child_alive() {
        let (endpoint, _child) = start(1);
        let slow = request(json!(1), "sleep", json!({"ms": 300}));
        let result = endpoint
            .call(&JsonRpcId::Number(1), &slow, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::CallTimeout { timeout_ms: 50, .. })
        ));
        assert!(endpoint.is_alive());

        let set = request(json!(2), "state/set", json!({"key": "k", "value": 1}));
        endpoint.call(&JsonRpcId::Number(2), &set, None).await.unwrap();
        let get = request(json!(3), "state/get", json!({"key": "k"}));
        let got = endpoint.call(&JsonRpcId::Number(3), &get, None).await.unwrap();
        assert_eq!(got["result"]["value"], json!(1));
    }

    #[tokio::test]
    async fn test_crash_fails_all_pending_calls() {
        let (endpoint, child) = start(3);
        let a = request(json!(1), "sleep", json!({"ms": 5000}));
        let b = request(json!(2), "sleep", json!({"ms": 5000}));
        let crash = request(json!(3), "crash", json!({}));

        let (ra, rb, rc) = tokio::join!(
            endpoint.call(&JsonRpcId::Number(1), &a, None),
            endpoint.call(&JsonRpcId::Number(2), &b, None),
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                endpoint.call(&JsonRpcId::Number(3), &crash, None).await
            }
        );
        for result in [ra, rb, rc] {
            assert!(matches!(result, Err(SessionError::ChildCrashed { .. })));
        }
        assert!(!endpoint.is_alive());
        assert!(child.exited.is_cancelled());
        assert!(matches!(
            endpoint.closed_signal().wait().await,
            SessionError::ChildCrashed { .. }
        ));
    }

    #[tokio::test]
    async fn test_garbage_output_is_protocol_framing() {
        let (endpoint, _child) = start(1);
        let result = endpoint
            .call(&JsonRpcId::Number(1), &request(json!(1), "garbage", json!({})), None)
            .await;
        assert!(matches!(result, Err(SessionError::ProtocolFraming { .. })));
        assert!(!endpoint.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_first_cause_wins() {
        let (endpoint, child) = start(1);
        let pending = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move {
                let slow = request(json!(1), "sleep", json!({"ms": 5000}));
                endpoint.call(&JsonRpcId::Number(1), &slow, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let idle = SessionError::IdleEvicted {
            session_id: "s".into(),
        };
        tokio::join!(
            endpoint.terminate(idle.clone()),
            endpoint.terminate(SessionError::ChildCrashed {
                session_id: "s".into()
            })
        );
        endpoint.terminate(idle.clone()).await;

        assert_eq!(pending.await.unwrap(), Err(idle.clone()));
        assert_eq!(endpoint.close_cause(), Some(idle.clone()));
        child.exited.cancelled().await;

        let after = endpoint
            .call(&JsonRpcId::Number(2), &request(json!(2), "ping", json!({})), None)
            .await;
        assert_eq!(after, Err(idle));
    }

    #[tokio::test]
    async fn test_progress_notifications_are_broadcast() {
        let (endpoint, _child) = start(1);
        let mut rx = endpoint.subscribe();
        let call = request(
            json!(1),
            "progress",
            json!({"steps": 3, "_meta": {"progressToken": "tok"}}),
        );
        endpoint.call(&JsonRpcId::Number(1), &call, None).await.unwrap();

        for step in 1..=3 {
            let note = rx.recv().await.unwrap();
            assert_eq!(note["method"], "notifications/progress");
            assert_eq!(note["params"]["progress"], json!(step));
        }
    }

    #[tokio::test]
    async fn test_requests_from_child_are_refused() {
        let (endpoint, _child) = start(1);
        let response = endpoint
            .call(&JsonRpcId::Number(1), &request(json!(1), "ask", json!({})), None)
            .await
            .unwrap();
        assert_eq!(response["result"]["answer"]["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_late_response_not_delivered_to_reused_id() {
        let (endpoint, _child) = start(1);
        let first = request(json!(1), "work", json!({"ms": 300}));
        let result = endpoint
            .call(&JsonRpcId::Number(1), &first, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(SessionError::CallTimeout { .. })));

        // The child answers the timed-out call first, still carrying its wire id.
        let second = request(json!(1), "work", json!({"ms": 0}));
        let response = endpoint
            .call(&JsonRpcId::Number(1), &second, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["served_call"], json!(2));
        assert_eq!(endpoint.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_channel_receives_every_step() {
        let (endpoint, _child) = start(1);
        let mut unclaimed = endpoint.subscribe();
        let (tx, mut rx) = mpsc::channel::<Value>(4);
        let consumer = tokio::spawn(async move {
            let mut steps = Vec::new();
            while let Some(note) = rx.recv().await {
                tokio::task::yield_now().await;
                steps.push(note["params"]["progress"].as_u64().unwrap());
            }
            steps
        });

        let call = request(
            json!(1),
            "progress",
            json!({"steps": 300, "_meta": {"progressToken": "tok"}}),
        );
        let response = endpoint
            .call_with_progress(&JsonRpcId::Number(1), &call, None, tx)
            .await
            .unwrap();
        assert_eq!(response["result"]["steps"], json!(300));

        let steps = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(steps, (1..=300).collect::<Vec<u64>>());
        assert!(matches!(
            unclaimed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_child_requests_reach_subscriber() {
        let (endpoint, _child) = start(1);
        let mut rx = endpoint.subscribe();
        let call = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move {
                let ask = request(json!(1), "ask", json!({}));
                endpoint.call(&JsonRpcId::Number(1), &ask, None).await
            })
        };

        let asked = rx.recv().await.unwrap();
        assert_eq!(asked["method"], "roots/list");
        endpoint
            .send_notification(&json!({
                "jsonrpc": "2.0",
                "id": asked["id"].clone(),
                "result": {"roots": []},
            }))
            .await
            .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["answer"]["result"]["roots"], json!([]));
    }

    #[tokio::test]
    async fn test_cancellation_names_the_wire_id() {
        let (endpoint, _child) = start(2);
        let slow = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move {
                let sleep = request(json!("c"), "sleep", json!({"ms": 200}));
                endpoint
                    .call(&JsonRpcId::String("c".into()), &sleep, None)
                    .await
            })
        };
        wait_until_pending(&endpoint, 1).await;

        endpoint
            .send_notification(&json!({
                "jsonrpc": "2.0",
                "method": CANCELLED_METHOD,
                "params": {"requestId": "c"},
            }))
            .await
            .unwrap();
        let listed = endpoint
            .call(
                &JsonRpcId::Number(2),
                &request(json!(2), "cancelled/list", json!({})),
                None,
            )
            .await
            .unwrap();
        let ids = listed["result"]["request_ids"].as_array().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids[0].is_u64());

        assert_eq!(slow.await.unwrap().unwrap()["id"], json!("c"));
    }

    async fn wait_until_pending(endpoint: &ChildEndpoint, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while endpoint.pending_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_notifications_reach_child() {
        let (endpoint, _child) = start(1);
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        endpoint.send_notification(&note).await.unwrap();
        endpoint.send_notification(&note).await.unwrap();

        let count = endpoint
            .call(
                &JsonRpcId::Number(1),
                &request(json!(1), "notifications/count", json!({})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(count["result"]["count"], json!(2));
    }

    #[tokio::test]
    async fn test_child_exit_without_pending_calls_closes_endpoint() {
        let (endpoint, child) = start(1);
        child.kill.cancel();

        let cause = tokio::time::timeout(Duration::from_secs(2), endpoint.closed_signal().wait())
            .await
            .unwrap();
        assert!(matches!(cause, SessionError::ChildCrashed { .. }));
        assert!(!endpoint.is_alive());
    }
}
