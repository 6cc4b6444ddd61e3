//! sheetmux HTTP, SSE and WebSocket front end.
//!
//! This crate contains the client transports, the admin server and the CLI
//! for the `sheetmux` binary. Session handling lives in `sheetmux-core`.

pub mod admin;
pub mod cli;
pub mod error;
pub mod transport;
