//! Mock stdio tool server for exercising the sheetmux proxy.
//!
//! Speaks NDJSON JSON-RPC on stdin/stdout and keeps per-process state, like
//! the spreadsheet server it stands in for. Each request is answered on its
//! own task, so a `sleep` does not hold up later requests.
//!
//! # Methods
//!
//! | Method | Result |
//! |--------|--------|
//! | `initialize` | server info and capabilities |
//! | `ping` | `{}` |
//! | `echo` | the request's `params` |
//! | `state/set {key, value}` / `state/get {key}` | per-process key/value store |
//! | `sleep {ms}` | `{"slept_ms": ms}` after the delay |
//! | `progress {steps}` | `notifications/progress` per step for `params._meta.progressToken` (or `params.progressToken`), then `{"steps": steps}` |
//! | `pid` | `{"pid": <process id>}` |
//! | `notify {message}` | `notifications/message` carrying `message`, then `{}` |
//! | `ask` | sends a `roots/list` request to the client, then `{"answer": <its response>}` |
//! | `crash` | exits with status 3 without answering |
//! | `garbage` | writes a line that is not JSON |
//!
//! The server exits cleanly when stdin closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct Server {
    store: Mutex<HashMap<String, Value>>,
    /// Requests this server sent to the client, by id.
    asks: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    next_ask: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let server = Arc::new(Server::default());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        match (id, method) {
            (Some(id), Some(method)) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                tokio::spawn(handle(id, method, params, Arc::clone(&server), tx.clone()));
            }
            (Some(id), None) => {
                let waiter = id.as_str().and_then(|id| {
                    server
                        .asks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(id)
                });
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message);
                }
            }
            // Notifications need no answer.
            _ => {}
        }
    }

    drop(tx);
    let _ = writer.await;
}

async fn handle(id: Value, method: String, params: Value, server: Arc<Server>, tx: mpsc::UnboundedSender<String>) {
    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2025-03-26",
            "serverInfo": {"name": "mock_sheet_server", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {}},
        }),
        "ping" => json!({}),
        "echo" => params,
        "state/set" => {
            let key = params["key"].as_str().unwrap_or_default().to_string();
            server
                .store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, params["value"].clone());
            json!({})
        }
        "state/get" => {
            let key = params["key"].as_str().unwrap_or_default();
            let value = server
                .store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
                .unwrap_or(Value::Null);
            json!({"value": value})
        }
        "sleep" => {
            let ms = params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            json!({"slept_ms": ms})
        }
        "progress" => {
            let steps = params["steps"].as_u64().unwrap_or(1);
            let token = match &params["_meta"]["progressToken"] {
                Value::Null => params["progressToken"].clone(),
                token => token.clone(),
            };
            for step in 1..=steps {
                send(&tx, &json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progressToken": token, "progress": step, "total": steps},
                }));
            }
            json!({"steps": steps})
        }
        "pid" => json!({"pid": std::process::id()}),
        "notify" => {
            send(&tx, &json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": params["message"].clone()},
            }));
            json!({})
        }
        "ask" => {
            let ask_id = format!("mock-ask-{}", server.next_ask.fetch_add(1, Ordering::Relaxed) + 1);
            let (waiter, answer) = oneshot::channel();
            server
                .asks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(ask_id.clone(), waiter);
            send(&tx, &json!({"jsonrpc": "2.0", "id": ask_id, "method": "roots/list"}));
            match answer.await {
                Ok(response) => json!({"answer": response}),
                Err(_) => return,
            }
        }
        "crash" => std::process::exit(3),
        "garbage" => {
            let _ = tx.send("<<not json>>\n".to_string());
            return;
        }
        other => {
            send(&tx, &json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("Method not found: {other}")},
            }));
            return;
        }
    };
    send(&tx, &json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn send(tx: &mpsc::UnboundedSender<String>, message: &Value) {
    let _ = tx.send(format!("{message}\n"));
}
