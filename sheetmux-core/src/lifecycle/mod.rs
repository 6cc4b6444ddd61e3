//! Process lifecycle: startup readiness, request draining and shutdown.
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! Transports take a [`RequestGuard`] per call so shutdown can wait for
//! in-flight work; background tasks watch [`LifecycleManager::shutdown_token`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod health;

pub use health::{HealthResponse, ReadinessChecks, ReadinessResponse, health_router};

const DRAIN_POLL: Duration = Duration::from_millis(100);
const DRAIN_LOG_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    /// New calls are refused; in-flight calls are draining.
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Upper bound on the whole shutdown sequence.
    pub shutdown_timeout: Duration,
    /// How long to wait for in-flight calls. Less than `shutdown_timeout`.
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
        }
    }
}

/// Startup prerequisites reported by `/ready`.
#[derive(Default)]
struct Readiness {
    config_loaded: AtomicBool,
    files_root_ready: AtomicBool,
    reaper_running: AtomicBool,
}

pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    active_requests: AtomicUsize,
    readiness: Readiness,
    config: LifecycleConfig,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Starting),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            active_requests: AtomicUsize::new(0),
            readiness: Readiness::default(),
            config,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// True from `begin_shutdown` on, including after `mark_stopped`.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn mark_ready(&self) {
        if self.state() == LifecycleState::Starting {
            self.state.store(Arc::new(LifecycleState::Ready));
            info!("sheetmux is ready");
        }
    }

    pub fn mark_config_loaded(&self) {
        self.readiness.config_loaded.store(true, Ordering::SeqCst);
    }

    pub fn mark_files_root_ready(&self) {
        self.readiness.files_root_ready.store(true, Ordering::SeqCst);
    }

    pub fn set_reaper_running(&self, running: bool) {
        self.readiness.reaper_running.store(running, Ordering::SeqCst);
    }

    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            config_loaded: self.readiness.config_loaded.load(Ordering::SeqCst),
            files_root_ready: self.readiness.files_root_ready.load(Ordering::SeqCst),
            reaper_running: self.readiness.reaper_running.load(Ordering::SeqCst),
        }
    }

    /// Cancelled by `begin_shutdown`.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Stop taking new calls and cancel the shutdown token. Idempotent.
    pub fn begin_shutdown(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!(
            active_requests = self.active_request_count(),
            "shutdown initiated"
        );
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// Count a call until the guard drops. `None` once shutdown has begun.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Wait until no call is tracked, or `drain_timeout` passes.
    pub async fn drain_requests(&self) -> DrainResult {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut poll = tokio::time::interval(DRAIN_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_log = tokio::time::Instant::now();

        loop {
            poll.tick().await;
            let active = self.active_request_count();
            if active == 0 {
                return DrainResult::Complete;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(active_requests = active, "drain timeout exceeded");
                return DrainResult::Timeout { remaining: active };
            }
            if now.duration_since(last_log) >= DRAIN_LOG_EVERY {
                info!(active_requests = active, "draining requests");
                last_log = now;
            }
        }
    }
}

/// One tracked call. Releases its count on drop, panics included.
pub struct RequestGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}
