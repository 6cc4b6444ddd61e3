//! Per-session state held in the table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::session::child::ChildEndpoint;

/// One client session bound to one child.
///
/// Activity is kept as milliseconds since the table's epoch so the reaper
/// can compare it without taking a lock.
pub struct SessionRecord {
    session_id: String,
    generation: u64,
    endpoint: Arc<ChildEndpoint>,
    epoch: Instant,
    last_activity_ms: AtomicU64,
    in_flight: AtomicUsize,
    retired: AtomicBool,
}

impl SessionRecord {
    pub(crate) fn new(
        session_id: &str,
        generation: u64,
        endpoint: Arc<ChildEndpoint>,
        epoch: Instant,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            generation,
            endpoint,
            epoch,
            last_activity_ms: AtomicU64::new(elapsed_ms(epoch)),
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Distinguishes successive children spawned under the same id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &Arc<ChildEndpoint> {
        &self.endpoint
    }

    /// Record activity now. Never moves the timestamp backwards.
    pub fn touch(&self) {
        self.last_activity_ms
            .fetch_max(elapsed_ms(self.epoch), Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        Duration::from_millis(elapsed_ms(self.epoch).saturating_sub(last))
    }

    /// Calls currently holding a lease on this record.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Unleased and quiet for at least `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.in_flight() == 0 && self.idle_for() >= threshold
    }

    fn pin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    fn unpin(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// First caller wins the right to tear this record down.
    pub(crate) fn claim_retirement(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// A call's hold on a session.
///
/// While any lease is alive the reaper treats the session as busy. Dropping
/// the lease records activity before releasing the pin.
pub struct SessionLease {
    record: Arc<SessionRecord>,
}

impl SessionLease {
    pub(crate) fn new(record: Arc<SessionRecord>) -> Self {
        record.pin();
        Self { record }
    }

    pub fn session_id(&self) -> &str {
        self.record.session_id()
    }

    pub fn generation(&self) -> u64 {
        self.record.generation()
    }

    pub fn endpoint(&self) -> &Arc<ChildEndpoint> {
        self.record.endpoint()
    }

    pub fn record(&self) -> &Arc<SessionRecord> {
        &self.record
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.record.touch();
        self.record.unpin();
    }
}
