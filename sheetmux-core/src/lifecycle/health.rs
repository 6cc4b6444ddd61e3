//! `/health` and `/ready` probes.
//!
//! Liveness stays 200 until the process is stopped, so an orchestrator does
//! not restart a proxy that is still draining. Readiness is 200 only in the
//! `Ready` state with every startup check passing.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use super::{LifecycleManager, LifecycleState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` or `unhealthy`.
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReadinessChecks {
    pub config_loaded: bool,
    /// The files root exists and is a directory.
    pub files_root_ready: bool,
    pub reaper_running: bool,
}

impl ReadinessChecks {
    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.first_failure().is_none()
    }

    /// Name of the first check that fails, in declaration order.
    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        [
            ("config_loaded", self.config_loaded),
            ("files_root_ready", self.files_root_ready),
            ("reaper_running", self.reaper_running),
        ]
        .into_iter()
        .find_map(|(name, ok)| (!ok).then_some(name))
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    pub checks: ReadinessChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(lifecycle)
}

async fn health(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let (code, status) = match lifecycle.state() {
        LifecycleState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        _ => (StatusCode::OK, "healthy"),
    };
    let body = HealthResponse {
        status,
        version: lifecycle.version(),
        uptime_seconds: lifecycle.uptime_seconds(),
    };
    (code, Json(body)).into_response()
}

async fn ready(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let checks = lifecycle.readiness_checks();
    let reason = if lifecycle.is_shutting_down() {
        Some("shutting_down".to_string())
    } else if let Some(failed) = checks.first_failure() {
        Some(failed.to_string())
    } else if !lifecycle.is_ready() {
        Some(format!("lifecycle_state: {}", lifecycle.state()))
    } else {
        None
    };

    let (code, status) = match reason {
        None => (StatusCode::OK, "ready"),
        Some(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
    };
    (
        code,
        Json(ReadinessResponse {
            status,
            checks,
            reason,
        }),
    )
        .into_response()
}
