//! Test helpers for sheetmux integration tests.
//!
//! [`TestProxy`] serves the real transport router on an ephemeral port, with
//! every session backed by a `mock_sheet_server` child process.

#![allow(dead_code)] // Not every test file uses every helper

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use sheetmux_core::config::ChildSettings;
use sheetmux_core::lifecycle::{LifecycleConfig, LifecycleManager};
use sheetmux_core::session::{
    Dispatcher, IdleReaper, ProcessLauncher, ReaperConfig, SessionTable, ShutdownRequest,
    TableOptions,
};
use sheetmux_proxy::transport::{self, AppState};

pub const SESSION_HEADER: &str = "x-session-id";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub call_timeout: Option<Duration>,
    pub max_in_flight: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(30),
            call_timeout: Some(Duration::from_secs(10)),
            max_in_flight: 1,
        }
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub table: Arc<SessionTable>,
    pub lifecycle: Arc<LifecycleManager>,
    pub client: reqwest::Client,
    server: tokio::task::JoinHandle<()>,
    _files_root: TempDir,
}

impl TestProxy {
    pub async fn start(options: ProxyOptions) -> Self {
        let files_root = TempDir::new().unwrap();
        let child = ChildSettings {
            command: env!("CARGO_BIN_EXE_mock_sheet_server").to_string(),
            args: Vec::new(),
            env: Vec::new(),
            files_root: files_root.path().to_path_buf(),
            shutdown: ShutdownRequest {
                stdin_close_grace: Duration::from_secs(1),
                sigterm_grace: Duration::from_millis(500),
            },
        };
        let table = SessionTable::new(
            Arc::new(ProcessLauncher::new(child.clone())),
            TableOptions {
                max_in_flight: options.max_in_flight,
                shutdown: child.shutdown.clone(),
            },
            None,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&table),
            options.call_timeout,
            None,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        IdleReaper::spawn(
            Arc::clone(&table),
            ReaperConfig {
                interval: options.reaper_interval,
                idle_timeout: options.idle_timeout,
            },
            lifecycle.shutdown_token(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = transport::router(AppState::new(dispatcher, Arc::clone(&lifecycle)));
        let shutdown = lifecycle.shutdown_token();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            addr,
            table,
            lifecycle,
            client: reqwest::Client::new(),
            server,
            _files_root: files_root,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST one message to the single-shot transport.
    pub async fn post(&self, session: Option<&str>, body: &Value) -> reqwest::Response {
        let mut request = self.client.post(self.url("/mcp")).json(body);
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        request.send().await.unwrap()
    }

    /// Call `method` on `session` and return the JSON-RPC response.
    pub async fn call(&self, session: &str, id: u64, method: &str, params: Value) -> Value {
        self.post(Some(session), &request(id, method, params))
            .await
            .json()
            .await
            .unwrap()
    }

    /// Process id of the child serving `session`.
    pub async fn child_pid(&self, session: &str) -> i32 {
        let response = self.call(session, 900, "pid", Value::Null).await;
        response["result"]["pid"].as_i64().unwrap() as i32
    }

    pub async fn delete(&self, session: &str) -> reqwest::Response {
        self.client
            .delete(self.url("/mcp"))
            .header(SESSION_HEADER, session)
            .send()
            .await
            .unwrap()
    }

    /// Open a WebSocket, optionally bound to `session` via the header.
    /// Returns the socket and the session id the proxy echoed.
    pub async fn connect_ws(&self, session: Option<&str>) -> (WsClient, String) {
        let mut request = format!("ws://{}/ws/mcp", self.addr)
            .into_client_request()
            .unwrap();
        if let Some(session) = session {
            request
                .headers_mut()
                .insert(SESSION_HEADER, HeaderValue::from_str(session).unwrap());
        }
        let (socket, response) = connect_async(request).await.unwrap();
        let echoed = response.headers()[SESSION_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        (socket, echoed)
    }

    pub async fn stop(self) {
        self.lifecycle.begin_shutdown();
        self.table.shutdown().await;
        let _ = self.server.await;
    }
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

/// Next JSON text frame, failing the test after five seconds.
pub async fn next_json(socket: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Binary(bytes) => return serde_json::from_slice(&bytes).unwrap(),
            _ => continue,
        }
    }
}

/// Whether a process with `pid` still exists (zombies included).
pub fn process_exists(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Poll `condition` every 20ms until it holds, failing after `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Parse an SSE body into `(event, data)` pairs, skipping keep-alives.
pub fn sse_events(body: &str) -> Vec<(String, String)> {
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
