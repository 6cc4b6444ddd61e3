//! The session engine.
//!
//! - [`launcher`]: starts one tool server per session
//! - [`child`]: NDJSON pipes, pending-response slots, crash detection
//! - [`record`]: per-session activity and leases
//! - [`table`]: the concurrent session map with compare-and-evict
//! - [`reaper`]: periodic idle eviction
//! - [`dispatcher`]: the single entry point every transport calls
//! - [`shutdown`]: graceful child stop sequence

pub mod child;
pub mod dispatcher;
pub mod launcher;
pub mod reaper;
pub mod record;
pub mod shutdown;
pub mod table;

#[cfg(test)]
pub(crate) mod test_support;

pub use child::{ChildEndpoint, ClosedSignal, EndpointOptions};
pub use dispatcher::{Dispatched, Dispatcher, Failure, ResponseSink, TransportKind};
pub use launcher::{ChildIo, ChildLauncher, ProcessLauncher};
pub use reaper::{IdleReaper, ReaperConfig};
pub use record::{SessionLease, SessionRecord};
#[cfg(unix)]
pub use shutdown::kill_process_group;
pub use shutdown::{ShutdownRequest, shutdown_child};
pub use table::{EvictionReason, SessionTable, TableOptions};
