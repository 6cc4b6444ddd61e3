//! Configuration: defaults, YAML file, and the resolved settings the
//! session engine runs with.
//!
//! Resolution order (later wins): [`SheetmuxDefaults::from_env`], the YAML
//! file, then command-line overrides applied by the binary.

pub mod defaults;
pub mod duration_format;
pub mod error;
pub mod loader;
pub mod schema;

pub use defaults::SheetmuxDefaults;
pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{find_config_file, load_and_validate, load_config, substitute_env_vars};
pub use schema::Config;

use std::path::PathBuf;
use std::time::Duration;

use crate::session::shutdown::ShutdownRequest;

/// Default child command: the spreadsheet tool server in stdio mode.
pub const DEFAULT_CHILD_COMMAND: &str = "python";
pub const DEFAULT_CHILD_ARGS: [&str; 3] = ["-m", "excel_mcp", "stdio"];

/// Environment variable every child receives, pointing at `files_root`.
pub const FILES_ROOT_ENV: &str = "EXCEL_FILES_PATH";

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind_host: String,
    pub bind_port: u16,
    pub admin_port: u16,
}

/// Session table, reaper and per-call settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    /// `None` disables the per-call deadline.
    pub call_timeout: Option<Duration>,
    pub max_in_flight: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SheetmuxDefaults::default())
    }
}

impl From<&SheetmuxDefaults> for SessionSettings {
    fn from(d: &SheetmuxDefaults) -> Self {
        Self {
            idle_timeout: d.idle_timeout,
            reaper_interval: d.reaper_interval,
            call_timeout: non_zero(d.call_timeout),
            max_in_flight: d.max_in_flight,
        }
    }
}

/// How each session's child is launched and stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub files_root: PathBuf,
    pub shutdown: ShutdownRequest,
}

impl From<&SheetmuxDefaults> for ChildSettings {
    fn from(d: &SheetmuxDefaults) -> Self {
        Self {
            command: DEFAULT_CHILD_COMMAND.to_string(),
            args: DEFAULT_CHILD_ARGS.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            files_root: d.files_root.clone(),
            shutdown: ShutdownRequest {
                stdin_close_grace: d.stdin_close_grace,
                sigterm_grace: d.sigterm_grace,
            },
        }
    }
}

/// Everything the proxy needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub child: ChildSettings,
    pub drain_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Settings {
    /// Merge an optional YAML config over the defaults.
    pub fn resolve(defaults: &SheetmuxDefaults, file: Option<&Config>) -> Self {
        let mut settings = Self {
            server: ServerSettings {
                bind_host: defaults.bind_host.clone(),
                bind_port: defaults.bind_port,
                admin_port: defaults.admin_port,
            },
            sessions: SessionSettings::from(defaults),
            child: ChildSettings::from(defaults),
            drain_timeout: defaults.drain_timeout,
            shutdown_timeout: defaults.shutdown_timeout,
        };

        let Some(file) = file else {
            return settings;
        };

        if let Some(host) = &file.server.host {
            settings.server.bind_host = host.clone();
        }
        if let Some(port) = file.server.port {
            settings.server.bind_port = port;
        }
        if let Some(port) = file.server.admin_port {
            settings.server.admin_port = port;
        }

        let s = &file.sessions;
        if let Some(d) = s.idle_timeout {
            settings.sessions.idle_timeout = d;
        }
        if let Some(d) = s.reaper_interval {
            settings.sessions.reaper_interval = d;
        }
        if let Some(d) = s.call_timeout {
            settings.sessions.call_timeout = non_zero(d);
        }
        if let Some(n) = s.max_in_flight {
            settings.sessions.max_in_flight = n;
        }

        let c = &file.child;
        if let Some(cmd) = &c.command {
            settings.child.command = cmd.clone();
        }
        if let Some(args) = &c.args {
            settings.child.args = args.clone();
        }
        settings.child.env = c.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(root) = &c.files_root {
            settings.child.files_root = root.clone();
        }
        if let Some(d) = c.stdin_close_grace {
            settings.child.shutdown.stdin_close_grace = d;
        }
        if let Some(d) = c.sigterm_grace {
            settings.child.shutdown.sigterm_grace = d;
        }

        settings
    }

    /// Check cross-field invariants after all overrides are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        defaults::validate_session_timing(
            self.sessions.idle_timeout,
            self.sessions.reaper_interval,
        )
        .map_err(|message| ConfigError::InvalidValue {
            field: "sessions".to_string(),
            message,
        })?;

        if self.sessions.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sessions.max_in_flight".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.child.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.child.shutdown.sigterm_grace.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "child.sigterm_grace".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}
