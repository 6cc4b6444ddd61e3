//! Background eviction of idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionSettings;
use crate::session::table::SessionTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between scans.
    pub interval: Duration,
    /// Quiet time after which an unleased session is evicted.
    pub idle_timeout: Duration,
}

impl From<&SessionSettings> for ReaperConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            interval: settings.reaper_interval,
            idle_timeout: settings.idle_timeout,
        }
    }
}

pub struct IdleReaper;

impl IdleReaper {
    /// Scan the table every `interval` until `shutdown` fires.
    ///
    /// A session idle for `idle_timeout` is gone within one interval after
    /// crossing the threshold.
    pub fn spawn(
        table: Arc<SessionTable>,
        config: ReaperConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // Skip immediate first tick
            info!(
                interval_secs = config.interval.as_secs_f64(),
                idle_timeout_secs = config.idle_timeout.as_secs_f64(),
                "idle reaper started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("idle reaper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        let evicted = table.reap_idle(config.idle_timeout).await;
                        if evicted > 0 {
                            info!(evicted, remaining = table.len(), "reaped idle sessions");
                        }
                    }
                }
            }
        })
    }
}
