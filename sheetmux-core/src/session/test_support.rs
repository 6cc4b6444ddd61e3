//! In-process scripted tool server for session tests.
//!
//! The child speaks NDJSON over a pair of `tokio::io::duplex` pipes, keeps
//! per-instance state, and exits when its stdin closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::session::launcher::{ChildIo, ChildLauncher};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Observation and control handle for one scripted child.
#[derive(Clone)]
pub(crate) struct FakeChildHandle {
    pub instance: usize,
    /// Cancelled once the child's loop has ended.
    pub exited: CancellationToken,
    /// Cancel to make the child exit abruptly.
    pub kill: CancellationToken,
}

pub(crate) struct FakeLauncher {
    spawned: AtomicUsize,
    failing: AtomicBool,
    spawn_delay: Duration,
    children: Mutex<Vec<FakeChildHandle>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Self::with_spawn_delay(Duration::ZERO)
    }

    pub fn with_spawn_delay(spawn_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            spawned: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            spawn_delay,
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn children(&self) -> Vec<FakeChildHandle> {
        self.children.lock().unwrap().clone()
    }

    /// Handle of the `instance`-th child spawned (1-based).
    pub fn child(&self, instance: usize) -> FakeChildHandle {
        self.children()
            .into_iter()
            .find(|c| c.instance == instance)
            .unwrap()
    }
}

#[async_trait]
impl ChildLauncher for FakeLauncher {
    async fn launch(&self, session_id: &str) -> Result<ChildIo, SessionError> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SessionError::SpawnFailure {
                session_id: session_id.to_string(),
                reason: "launcher configured to fail".to_string(),
            });
        }
        let instance = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let (io, handle) = spawn_scripted_child(instance);
        self.children.lock().unwrap().push(handle);
        Ok(io)
    }
}

/// Start a scripted child and return the proxy side of its pipes.
pub(crate) fn spawn_scripted_child(instance: usize) -> (ChildIo, FakeChildHandle) {
    let (proxy_stdin, child_stdin) = tokio::io::duplex(PIPE_CAPACITY);
    let (child_stdout, proxy_stdout) = tokio::io::duplex(PIPE_CAPACITY);
    let handle = FakeChildHandle {
        instance,
        exited: CancellationToken::new(),
        kill: CancellationToken::new(),
    };
    tokio::spawn(run_child(instance, child_stdin, child_stdout, handle.clone()));
    (
        ChildIo {
            stdin: Box::new(proxy_stdin),
            stdout: Box::new(proxy_stdout),
            process: None,
        },
        handle,
    )
}

/// Poll `condition` every 10ms for up to two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}

fn line(message: &Value) -> String {
    format!("{message}\n")
}

fn reply(id: &Value, result: Value) -> String {
    line(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

enum Step {
    Continue,
    Exit,
}

struct ChildState {
    instance: usize,
    values: HashMap<String, Value>,
    notifications: u64,
    /// Original request id of an `ask`, waiting for the proxy's answer.
    asking: Option<Value>,
    /// `requestId`s of every `notifications/cancelled` received.
    cancelled: Vec<Value>,
    /// Serial worker for `work`: answers strictly in arrival order.
    work: mpsc::UnboundedSender<(Value, u64)>,
}

async fn run_child(
    instance: usize,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    handle: FakeChildHandle,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut lines = BufReader::new(stdin).lines();
    let (work, work_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(work_rx, tx.clone()));
    let mut state = ChildState {
        instance,
        values: HashMap::new(),
        notifications: 0,
        asking: None,
        cancelled: Vec::new(),
        work,
    };

    loop {
        tokio::select! {
            _ = handle.kill.cancelled() => break,
            Some(out) = rx.recv() => {
                if stdout.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
            read = lines.next_line() => {
                let Ok(Some(text)) = read else { break };
                let Ok(message) = serde_json::from_str::<Value>(&text) else { continue };
                match handle_message(&mut state, message, &tx) {
                    Step::Continue => {}
                    Step::Exit => break,
                }
            }
        }
    }
    handle.exited.cancel();
}

/// Answers `work` requests one at a time, tagging each with its arrival number.
async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<(Value, u64)>,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut served = 0u64;
    while let Some((id, ms)) = jobs.recv().await {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        served += 1;
        let _ = tx.send(reply(&id, json!({"served_call": served})));
    }
}

fn handle_message(state: &mut ChildState, message: Value, tx: &mpsc::UnboundedSender<String>) -> Step {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(Value::as_str).map(str::to_string);
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    if id.is_none() && method.as_deref() == Some("notifications/cancelled") {
        state.cancelled.push(params["requestId"].clone());
        state.notifications += 1;
        return Step::Continue;
    }

    let (Some(id), Some(method)) = (id.clone(), method) else {
        // A response to our `ask`, or a notification.
        if id.is_some() {
            if let Some(original) = state.asking.take() {
                let _ = tx.send(reply(&original, json!({"answer": message})));
            }
        } else {
            state.notifications += 1;
        }
        return Step::Continue;
    };

    match method.as_str() {
        "ping" => {
            let _ = tx.send(reply(&id, json!({})));
        }
        "whoami" => {
            let _ = tx.send(reply(&id, json!({"instance": state.instance})));
        }
        "state/set" => {
            let key = params["key"].as_str().unwrap_or_default().to_string();
            state.values.insert(key, params["value"].clone());
            let _ = tx.send(reply(&id, json!({})));
        }
        "state/get" => {
            let key = params["key"].as_str().unwrap_or_default();
            let value = state.values.get(key).cloned().unwrap_or(Value::Null);
            let _ = tx.send(reply(&id, json!({"value": value})));
        }
        "cancelled/list" => {
            let _ = tx.send(reply(&id, json!({"request_ids": state.cancelled})));
        }
        "work" => {
            let ms = params["ms"].as_u64().unwrap_or(0);
            let _ = state.work.send((id, ms));
        }
        "notifications/count" => {
            let _ = tx.send(reply(&id, json!({"count": state.notifications})));
        }
        "sleep" => {
            let ms = params["ms"].as_u64().unwrap_or(0);
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = tx.send(reply(&id, json!({"slept_ms": ms})));
            });
        }
        "progress" => {
            let steps = params["steps"].as_u64().unwrap_or(1);
            let token = params["_meta"]["progressToken"].clone();
            for step in 1..=steps {
                let _ = tx.send(line(&json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progressToken": token, "progress": step, "total": steps},
                })));
            }
            let _ = tx.send(reply(&id, json!({"steps": steps})));
        }
        "ask" => {
            state.asking = Some(id);
            let _ = tx.send(line(&json!({
                "jsonrpc": "2.0",
                "id": "child-ask-1",
                "method": "roots/list",
            })));
        }
        "garbage" => {
            let _ = tx.send("this is not json\n".to_string());
        }
        "crash" => return Step::Exit,
        other => {
            let _ = tx.send(line(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unknown method {other}")},
            })));
        }
    }
    Step::Continue
}
