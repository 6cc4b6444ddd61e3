//! sheetmux: puts many clients in front of a single-client stdio tool server
//! by giving each session its own child process.
//!
//! Client traffic is served on `FASTMCP_HOST:FASTMCP_PORT` (default
//! `0.0.0.0:8017`); health and metrics on the admin port (default 8018).

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sheetmux_core::config::{Settings, SheetmuxDefaults, find_config_file, load_and_validate};
use sheetmux_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use sheetmux_core::metrics::SheetmuxMetrics;
use sheetmux_core::session::{
    Dispatcher, IdleReaper, ProcessLauncher, ReaperConfig, SessionTable, TableOptions,
};
use sheetmux_proxy::admin::{AdminServer, AdminState};
use sheetmux_proxy::cli::Cli;
use sheetmux_proxy::transport::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The guards flush buffered log lines on drop; hold them until exit.
    let _log_guards = init_logging(cli.log_file.as_deref())?;

    let defaults = SheetmuxDefaults::from_env();
    if let Err(msg) = defaults.validate() {
        error!(reason = %msg, "Invalid configuration defaults, refusing to start");
        std::process::exit(1);
    }

    let file_config = match find_config_file(cli.config.as_deref())? {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            let (config, result) = load_and_validate(&path)?;
            for warning in &result.warnings {
                warn!(warning = %warning, "Configuration warning");
            }
            Some(config)
        }
        None => None,
    };
    let mut settings = Settings::resolve(&defaults, file_config.as_ref());
    cli.apply(&mut settings);
    settings.validate()?;

    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig {
        shutdown_timeout: settings.shutdown_timeout,
        drain_timeout: settings.drain_timeout,
    }));
    lifecycle.mark_config_loaded();

    tokio::fs::create_dir_all(&settings.child.files_root).await?;
    lifecycle.mark_files_root_ready();
    info!(files_root = %settings.child.files_root.display(), "Files root ready");

    let mut prom_registry = Registry::default();
    let metrics = Arc::new(SheetmuxMetrics::new(&mut prom_registry));
    let prom_registry = Arc::new(prom_registry);

    let shutdown = lifecycle.shutdown_token();

    let launcher = Arc::new(ProcessLauncher::new(settings.child.clone()));
    let table = SessionTable::new(
        launcher,
        TableOptions::from_settings(&settings.sessions, &settings.child),
        Some(metrics.clone()),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&table),
        settings.sessions.call_timeout,
        Some(metrics.clone()),
    ));

    let reaper = IdleReaper::spawn(
        Arc::clone(&table),
        ReaperConfig::from(&settings.sessions),
        shutdown.clone(),
    );
    lifecycle.set_reaper_running(true);

    let admin = AdminServer::new(
        &settings.server.bind_host,
        settings.server.admin_port,
        AdminState {
            lifecycle: lifecycle.clone(),
            prom_registry,
            metrics: Some(metrics.clone()),
        },
    );
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });

    let addr = format!("{}:{}", settings.server.bind_host, settings.server.bind_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        admin_port = settings.server.admin_port,
        child = %settings.child.command,
        idle_timeout_secs = settings.sessions.idle_timeout.as_secs(),
        reaper_interval_secs = settings.sessions.reaper_interval.as_secs(),
        max_in_flight = settings.sessions.max_in_flight,
        "sheetmux starting"
    );

    setup_signal_handlers(lifecycle.clone(), Arc::clone(&table));
    lifecycle.mark_ready();

    let app = transport::router(AppState::new(Arc::clone(&dispatcher), lifecycle.clone()));
    let serve_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                serve_shutdown.cancelled().await;
                info!("Shutdown signal received, stopping new connections");
            })
            .await
    });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = &mut server => {
            // The listener failed before any shutdown was requested.
            lifecycle.begin_shutdown();
            result??;
        }
    }

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for active requests to drain"
    );
    let drain_result = lifecycle.drain_requests().await;

    // Fails whatever is still waiting on a child.
    let terminated = table.shutdown().await;
    info!(terminated, "Terminated remaining sessions");
    lifecycle.set_reaper_running(false);
    let _ = reaper.await;

    let grace = settings
        .shutdown_timeout
        .saturating_sub(settings.drain_timeout);
    if !server.is_finished() && tokio::time::timeout(grace, &mut server).await.is_err() {
        warn!("Connections still open after shutdown timeout, aborting");
        server.abort();
    }
    lifecycle.mark_stopped();

    match drain_result {
        DrainResult::Complete => {
            info!("All requests drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            Err(format!("Drain timeout exceeded with {remaining} remaining requests").into())
        }
    }
}

/// JSON logs to stdout, and to `log_file` as well when given.
fn init_logging(log_file: Option<&Path>) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let mut guards = Vec::new();

    let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(guard);

    let file_layer = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("--log-file {} has no file name", path.display()))?;
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            guards.push(guard);
            Some(tracing_subscriber::fmt::layer().json().with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(stdout))
        .with(file_layer)
        .init();

    Ok(guards)
}

/// SIGINT and SIGTERM begin a graceful shutdown; SIGQUIT exits at once.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>, table: Arc<SessionTable>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        use sheetmux_core::session::kill_process_group;
        use tokio::signal::unix::{SignalKind, signal};

        let lifecycle_sigterm = lifecycle.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    lifecycle_sigterm.begin_shutdown();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });

        let lifecycle_sigquit = lifecycle;
        tokio::spawn(async move {
            match signal(SignalKind::quit()) {
                Ok(mut sigquit) => {
                    sigquit.recv().await;
                    warn!(
                        active_requests = lifecycle_sigquit.active_request_count(),
                        "Received SIGQUIT, immediate shutdown (no drain)"
                    );
                    lifecycle_sigquit.mark_stopped();
                    // No drain. Children lead their own process groups and
                    // `kill_on_drop` never runs on exit, so kill them here.
                    let pids = table.child_pids();
                    for pid in &pids {
                        kill_process_group(*pid);
                    }
                    warn!(children = pids.len(), "killed child process groups");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGQUIT");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = (lifecycle, table);
}
