//! Centralized default values for sheetmux configuration.
//!
//! The idle window and sweep cadence match what deployments of the
//! spreadsheet tool server have always run with: five minutes idle,
//! swept once a minute.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Centralized default values for sheetmux configuration.
///
/// Used when neither the YAML file nor the command line sets a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetmuxDefaults {
    /// A session untouched for this long is evicted.
    pub idle_timeout: Duration,

    /// How often the idle reaper sweeps the session table.
    pub reaper_interval: Duration,

    /// Per-call response deadline. Zero disables the deadline.
    pub call_timeout: Duration,

    /// Calls written to one child before earlier ones have answered.
    pub max_in_flight: usize,

    /// Time a child gets to exit on its own after stdin is closed.
    pub stdin_close_grace: Duration,

    /// Time a child gets after SIGTERM before SIGKILL.
    pub sigterm_grace: Duration,

    /// Time to wait for in-flight requests during shutdown.
    /// Must be less than `shutdown_timeout`.
    pub drain_timeout: Duration,

    /// Maximum time for graceful shutdown.
    pub shutdown_timeout: Duration,

    /// Bind address for client traffic.
    pub bind_host: String,

    /// Port for client traffic.
    pub bind_port: u16,

    /// Port for `/health`, `/ready` and `/metrics`.
    pub admin_port: u16,

    /// Working directory and `EXCEL_FILES_PATH` for every child.
    pub files_root: PathBuf,
}

impl Default for SheetmuxDefaults {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(120),
            max_in_flight: 1,
            stdin_close_grace: Duration::from_secs(5),
            sigterm_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(25), // Must be < shutdown_timeout
            shutdown_timeout: Duration::from_secs(30),
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8017,
            admin_port: 8018,
            files_root: std::env::temp_dir().join("excel_mcp_files"),
        }
    }
}

impl SheetmuxDefaults {
    /// Create defaults from environment variables.
    ///
    /// # Environment Variables
    /// - `SHEETMUX_IDLE_TIMEOUT_SECS`
    /// - `SHEETMUX_REAPER_INTERVAL_SECS`
    /// - `SHEETMUX_CALL_TIMEOUT_SECS`
    /// - `SHEETMUX_MAX_IN_FLIGHT`
    /// - `SHEETMUX_DRAIN_TIMEOUT_SECS`
    /// - `SHEETMUX_SHUTDOWN_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            idle_timeout: Duration::from_secs(parse_env_warn(
                "SHEETMUX_IDLE_TIMEOUT_SECS",
                default.idle_timeout.as_secs(),
            )),

            reaper_interval: Duration::from_secs(parse_env_warn(
                "SHEETMUX_REAPER_INTERVAL_SECS",
                default.reaper_interval.as_secs(),
            )),

            call_timeout: Duration::from_secs(parse_env_warn(
                "SHEETMUX_CALL_TIMEOUT_SECS",
                default.call_timeout.as_secs(),
            )),

            max_in_flight: parse_env_warn("SHEETMUX_MAX_IN_FLIGHT", default.max_in_flight),

            drain_timeout: Duration::from_secs(parse_env_warn(
                "SHEETMUX_DRAIN_TIMEOUT_SECS",
                default.drain_timeout.as_secs(),
            )),

            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "SHEETMUX_SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),

            // Bind and path settings come from the CLI and their env aliases.
            ..default
        }
    }

    /// Validate the defaults satisfy invariants.
    ///
    /// # Invariants
    /// 1. `drain_timeout` < `shutdown_timeout`
    /// 2. `reaper_interval` <= `idle_timeout`, both non-zero
    /// 3. `max_in_flight` >= 1
    /// 4. `sigterm_grace` > 0
    pub fn validate(&self) -> Result<(), String> {
        if self.drain_timeout >= self.shutdown_timeout {
            return Err(format!(
                "drain_timeout ({:?}) must be less than shutdown_timeout ({:?})",
                self.drain_timeout, self.shutdown_timeout
            ));
        }

        validate_session_timing(self.idle_timeout, self.reaper_interval)?;

        if self.max_in_flight == 0 {
            return Err("max_in_flight must be at least 1".to_string());
        }

        if self.sigterm_grace.is_zero() {
            return Err("sigterm_grace must be greater than zero".to_string());
        }

        Ok(())
    }
}

/// Shared by defaults and resolved settings.
pub(crate) fn validate_session_timing(
    idle_timeout: Duration,
    reaper_interval: Duration,
) -> Result<(), String> {
    if idle_timeout.is_zero() || reaper_interval.is_zero() {
        return Err("idle_timeout and reaper_interval must be greater than zero".to_string());
    }
    if reaper_interval > idle_timeout {
        return Err(format!(
            "reaper_interval ({reaper_interval:?}) must not exceed idle_timeout ({idle_timeout:?})"
        ));
    }
    Ok(())
}

/// Parse an environment variable with a warning on invalid values.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
