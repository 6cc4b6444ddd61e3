//! Configuration file schema.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::duration_format;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure.
///
/// Every section and field is optional; unset values fall back to
/// [`super::SheetmuxDefaults`].
///
/// # Example
/// ```yaml
/// schema: 1
///
/// server:
///   host: 127.0.0.1
///   port: 8017
///
/// sessions:
///   idle_timeout: 5m
///   reaper_interval: 1m
///   call_timeout: 2m
///
/// child:
///   command: python
///   args: ["-m", "excel_mcp", "stdio"]
///   files_root: /srv/sheets
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Schema version (must be 1).
    #[serde(default = "default_schema")]
    pub schema: u32,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub child: ChildConfig,
}

fn default_schema() -> u32 {
    1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Listener addresses.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Port for `/health`, `/ready` and `/metrics`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<u16>,
}

/// Session table and reaper tuning.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsConfig {
    #[serde(
        default,
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<Duration>,

    #[serde(
        default,
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub reaper_interval: Option<Duration>,

    /// `0` disables the per-call deadline.
    #[serde(
        default,
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub call_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
}

/// How each session's tool server is launched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChildConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Extra environment for the child, on top of the proxy's own.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_root: Option<PathBuf>,

    #[serde(
        default,
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stdin_close_grace: Option<Duration>,

    #[serde(
        default,
        deserialize_with = "duration_format::deserialize_option",
        serialize_with = "duration_format::serialize_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub sigterm_grace: Option<Duration>,
}
