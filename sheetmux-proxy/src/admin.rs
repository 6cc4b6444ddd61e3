//! Admin listener: `/health`, `/ready` and `/metrics`.
//!
//! Kept off the client port so a flood of tool calls cannot starve probes.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sheetmux_core::lifecycle::{LifecycleManager, health_router};
use sheetmux_core::metrics::SheetmuxMetrics;

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<LifecycleManager>,
    pub prom_registry: Arc<Registry>,
    /// Uptime is refreshed on every scrape when present.
    pub metrics: Option<Arc<SheetmuxMetrics>>,
}

pub struct AdminServer {
    addr: String,
    state: AdminState,
}

impl AdminServer {
    pub fn new(bind_host: &str, port: u16, state: AdminState) -> Self {
        Self {
            addr: format!("{bind_host}:{port}"),
            state,
        }
    }

    pub fn router(&self) -> Router {
        let scrape = Router::new()
            .route("/metrics", get(scrape))
            .with_state(self.state.clone());
        health_router(Arc::clone(&self.state.lifecycle)).merge(scrape)
    }

    /// Bind and serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Bind or accept failures.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "Admin server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("Admin server stopped");
        Ok(())
    }
}

async fn scrape(State(state): State<AdminState>) -> Response {
    if let Some(metrics) = &state.metrics {
        let uptime = i64::try_from(state.lifecycle.uptime_seconds()).unwrap_or(i64::MAX);
        metrics.uptime_seconds.set(uptime);
    }

    let mut body = String::new();
    match encode(&mut body, &state.prom_registry) {
        Ok(()) => {
            let mut response = body.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(OPENMETRICS));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
