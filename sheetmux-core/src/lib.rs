//! sheetmux core: session multiplexing for stdio JSON-RPC tool servers.
//!
//! This library provides the session engine (child endpoints, the session
//! table, the idle reaper and the dispatcher), JSON-RPC classification and
//! NDJSON framing, configuration, lifecycle tracking, metrics, and the error
//! taxonomy shared by every transport in `sheetmux-proxy`.

pub mod config;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod lifecycle;
pub mod metrics;
pub mod session;
