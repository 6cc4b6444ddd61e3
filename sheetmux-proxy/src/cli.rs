//! Command-line flags for the `sheetmux` binary.
//!
//! Flags and their env aliases override the YAML file, which overrides the
//! built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use sheetmux_core::config::Settings;

/// Session-multiplexing proxy for a single-client stdio tool server.
///
/// Everything after `--` is the child command, for example
/// `sheetmux -- uvx excel-mcp-server stdio`.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Bind address for client traffic
    #[arg(long, env = "FASTMCP_HOST")]
    pub host: Option<String>,

    /// Port for client traffic
    #[arg(long, env = "FASTMCP_PORT")]
    pub port: Option<u16>,

    /// Port for /health, /ready and /metrics
    #[arg(long, env = "SHEETMUX_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Working directory and EXCEL_FILES_PATH for every child
    #[arg(long, env = "EXCEL_FILES_PATH")]
    pub files_root: Option<PathBuf>,

    /// Evict sessions untouched for this long (e.g. "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Time between idle sweeps (e.g. "60s")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub reaper_interval: Option<Duration>,

    /// Per-call response deadline; "0s" disables it
    #[arg(long, value_parser = humantime::parse_duration)]
    pub call_timeout: Option<Duration>,

    /// Calls written to one child before earlier ones have answered
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// YAML configuration file
    #[arg(long, env = "SHEETMUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write JSON logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Child command and arguments
    #[arg(last = true)]
    pub child: Vec<String>,
}

impl Cli {
    /// Apply flags on top of already-resolved settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server.bind_host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.bind_port = port;
        }
        if let Some(port) = self.admin_port {
            settings.server.admin_port = port;
        }
        if let Some(root) = &self.files_root {
            settings.child.files_root = root.clone();
        }
        if let Some(d) = self.idle_timeout {
            settings.sessions.idle_timeout = d;
        }
        if let Some(d) = self.reaper_interval {
            settings.sessions.reaper_interval = d;
        }
        if let Some(d) = self.call_timeout {
            settings.sessions.call_timeout = (!d.is_zero()).then_some(d);
        }
        if let Some(n) = self.max_in_flight {
            settings.sessions.max_in_flight = n;
        }
        if let Some((command, args)) = self.child.split_first() {
            settings.child.command = command.clone();
            settings.child.args = args.to_vec();
        }
    }
}
