//! Session id to child mapping.
//!
//! The table is a [`DashMap`] of cells. A cell is inserted under the shard
//! write lock before its child is spawned, so concurrent first calls for the
//! same id all wait on one spawn. Every removal goes through `remove_if` and
//! every lease is taken under the shard read lock, which makes eviction
//! linearizable with lookup.
//!
//! # Idle race policy
//!
//! Activity observed strictly before the eviction commit wins. A lease or a
//! [`SessionTable::touch`] holds the shard read lock while it records
//! activity; [`SessionTable::evict_if_idle`] re-checks idleness under the
//! write lock. If eviction commits first, the next call for the id finds it
//! vacant and spawns a fresh child.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::config::{ChildSettings, SessionSettings};
use crate::error::SessionError;
use crate::metrics::SheetmuxMetrics;
use crate::session::child::{ChildEndpoint, ClosedSignal, EndpointOptions};
use crate::session::launcher::ChildLauncher;
use crate::session::record::{SessionLease, SessionRecord};
use crate::session::shutdown::ShutdownRequest;

/// Why a session left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Idle,
    Crashed,
    Framing,
    Explicit,
    ConnectionClosed,
    Shutdown,
}

impl EvictionReason {
    /// Metric label and log field value.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Crashed => "crashed",
            Self::Framing => "framing",
            Self::Explicit => "explicit",
            Self::ConnectionClosed => "connection_closed",
            Self::Shutdown => "shutdown",
        }
    }

    /// The error delivered to calls still waiting when the session goes.
    pub fn to_error(self, session_id: &str) -> SessionError {
        let session_id = session_id.to_string();
        match self {
            Self::Idle => SessionError::IdleEvicted { session_id },
            Self::Crashed => SessionError::ChildCrashed { session_id },
            Self::Framing => SessionError::ProtocolFraming {
                session_id,
                reason: "malformed output from tool server".to_string(),
            },
            Self::Explicit => SessionError::SessionClosed {
                session_id,
                reason: "terminated by client".to_string(),
            },
            Self::ConnectionClosed => SessionError::SessionClosed {
                session_id,
                reason: "connection closed".to_string(),
            },
            Self::Shutdown => SessionError::SessionClosed {
                session_id,
                reason: "proxy shutting down".to_string(),
            },
        }
    }

    /// Whether a call that lost the race to this eviction may take a fresh child.
    fn allows_respawn(self) -> bool {
        matches!(self, Self::Idle | Self::Crashed | Self::Framing)
    }
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Settings applied to every child the table spawns.
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub max_in_flight: usize,
    pub shutdown: ShutdownRequest,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            shutdown: ShutdownRequest::default(),
        }
    }
}

impl TableOptions {
    pub fn from_settings(sessions: &SessionSettings, child: &ChildSettings) -> Self {
        Self {
            max_in_flight: sessions.max_in_flight,
            shutdown: child.shutdown.clone(),
        }
    }
}

struct SessionCell {
    generation: u64,
    /// Spawn outcome, shared by every caller that raced on this cell.
    record: OnceCell<Result<Arc<SessionRecord>, SessionError>>,
    /// Set under the shard write lock just before the cell is removed.
    evicted_as: OnceLock<EvictionReason>,
}

impl SessionCell {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            record: OnceCell::new(),
            evicted_as: OnceLock::new(),
        }
    }

    fn live_record(&self) -> Option<&Arc<SessionRecord>> {
        match self.record.get() {
            Some(Ok(record)) => Some(record),
            _ => None,
        }
    }

    /// Predicate body for `remove_if`: mark the cell and agree to removal.
    fn mark_evicted(&self, reason: EvictionReason) -> bool {
        let _ = self.evicted_as.set(reason);
        true
    }
}

enum Lookup {
    Live(SessionLease),
    Dead,
    Vacated,
}

/// All live sessions.
pub struct SessionTable {
    sessions: DashMap<String, Arc<SessionCell>>,
    launcher: Arc<dyn ChildLauncher>,
    options: TableOptions,
    epoch: Instant,
    next_generation: AtomicU64,
    closing: AtomicBool,
    metrics: Option<Arc<SheetmuxMetrics>>,
    weak_self: Weak<SessionTable>,
}

impl SessionTable {
    pub fn new(
        launcher: Arc<dyn ChildLauncher>,
        options: TableOptions,
        metrics: Option<Arc<SheetmuxMetrics>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            sessions: DashMap::new(),
            launcher,
            options,
            epoch: Instant::now(),
            next_generation: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            metrics,
            weak_self: weak_self.clone(),
        })
    }

    /// Lease the session for `session_id`, spawning its child if needed.
    ///
    /// Concurrent first calls for one id share a single spawn. A dead child
    /// found in the table is evicted and replaced at most once per call.
    ///
    /// # Errors
    ///
    /// - `SpawnFailure` if the child cannot be started
    /// - `SessionClosed` if the session was explicitly closed while starting,
    ///   or the table is shutting down
    /// - `ChildCrashed` / `ProtocolFraming` if a freshly spawned child is
    ///   already gone
    pub async fn get_or_create(&self, session_id: &str) -> Result<SessionLease, SessionError> {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Err(EvictionReason::Shutdown.to_error(session_id));
            }

            let mut inserted = false;
            let cell = {
                let entry = self
                    .sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        inserted = true;
                        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
                        Arc::new(SessionCell::new(generation))
                    });
                Arc::clone(entry.value())
            };

            let spawned = cell
                .record
                .get_or_init(|| self.spawn(session_id, cell.generation))
                .await;
            let record = match spawned {
                Ok(record) => Arc::clone(record),
                Err(e) => {
                    let e = e.clone();
                    self.sessions
                        .remove_if(session_id, |_, current| Arc::ptr_eq(current, &cell));
                    return Err(e);
                }
            };

            let lookup = match self.sessions.get(session_id) {
                Some(entry) if Arc::ptr_eq(entry.value(), &cell) => {
                    if record.endpoint().is_alive() {
                        Lookup::Live(SessionLease::new(Arc::clone(&record)))
                    } else {
                        Lookup::Dead
                    }
                }
                _ => Lookup::Vacated,
            };

            match lookup {
                Lookup::Live(lease) => return Ok(lease),
                Lookup::Dead => {
                    let cause = record.endpoint().close_cause();
                    let reason = match cause {
                        Some(SessionError::ProtocolFraming { .. }) => EvictionReason::Framing,
                        _ => EvictionReason::Crashed,
                    };
                    self.evict_generation(session_id, cell.generation, reason)
                        .await;
                    if inserted {
                        return Err(cause.unwrap_or_else(|| reason.to_error(session_id)));
                    }
                }
                Lookup::Vacated => {
                    let reason = cell
                        .evicted_as
                        .get()
                        .copied()
                        .unwrap_or(EvictionReason::Explicit);
                    self.retire(&record, reason).await;
                    if inserted || !reason.allows_respawn() {
                        return Err(reason.to_error(session_id));
                    }
                }
            }
        }
    }

    async fn spawn(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Result<Arc<SessionRecord>, SessionError> {
        let io = match self.launcher.launch(session_id).await {
            Ok(io) => io,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_spawn_failure();
                }
                tracing::error!(session_id, error = %e, "failed to start tool server");
                return Err(e);
            }
        };

        let endpoint = ChildEndpoint::start(
            session_id,
            io,
            EndpointOptions {
                max_in_flight: self.options.max_in_flight,
                shutdown: self.options.shutdown.clone(),
            },
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_spawn();
        }
        self.watch_exit(session_id, generation, endpoint.closed_signal());

        tracing::info!(
            session_id,
            generation,
            pid = endpoint.pid(),
            "session created"
        );
        Ok(Arc::new(SessionRecord::new(
            session_id,
            generation,
            endpoint,
            self.epoch,
        )))
    }

    /// Evict the session when its child dies on its own.
    fn watch_exit(&self, session_id: &str, generation: u64, signal: ClosedSignal) {
        let table = self.weak_self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let reason = match signal.wait().await {
                SessionError::ChildCrashed { .. } => EvictionReason::Crashed,
                SessionError::ProtocolFraming { .. } => EvictionReason::Framing,
                _ => return,
            };
            if let Some(table) = table.upgrade() {
                table.evict_generation(&session_id, generation, reason).await;
            }
        });
    }

    /// Refresh activity. Returns `false` if the id has no live session.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(entry) => match entry.live_record() {
                Some(record) => {
                    record.touch();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Remove the session and wait for its child to stop.
    ///
    /// Returns `false` if the id was not in the table.
    pub async fn evict(&self, session_id: &str, reason: EvictionReason) -> bool {
        let Some((_, cell)) = self
            .sessions
            .remove_if(session_id, |_, cell| cell.mark_evicted(reason))
        else {
            return false;
        };
        self.finish_eviction(session_id, &cell).await;
        true
    }

    /// Like [`evict`](Self::evict), but only if the entry still holds `generation`.
    pub async fn evict_generation(
        &self,
        session_id: &str,
        generation: u64,
        reason: EvictionReason,
    ) -> bool {
        let Some((_, cell)) = self.sessions.remove_if(session_id, |_, cell| {
            cell.generation == generation && cell.mark_evicted(reason)
        }) else {
            return false;
        };
        self.finish_eviction(session_id, &cell).await;
        true
    }

    /// Ids idle for at least `threshold` at the time of the scan.
    pub fn snapshot_idle_candidates(&self, threshold: Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .live_record()
                    .is_some_and(|record| record.is_idle(threshold))
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Evict only if the session is still idle when the removal commits.
    pub async fn evict_if_idle(&self, session_id: &str, threshold: Duration) -> bool {
        let Some((_, cell)) = self.sessions.remove_if(session_id, |_, cell| {
            cell.live_record()
                .is_some_and(|record| record.is_idle(threshold))
                && cell.mark_evicted(EvictionReason::Idle)
        }) else {
            return false;
        };
        self.finish_eviction(session_id, &cell).await;
        true
    }

    /// One reaper pass. Returns the number of sessions evicted.
    pub async fn reap_idle(&self, threshold: Duration) -> usize {
        let candidates = self.snapshot_idle_candidates(threshold);
        if candidates.is_empty() {
            return 0;
        }
        join_all(
            candidates
                .iter()
                .map(|id| self.evict_if_idle(id, threshold)),
        )
        .await
        .into_iter()
        .filter(|evicted| *evicted)
        .count()
    }

    /// Evict every session for `reason`.
    pub async fn terminate_all(&self, reason: EvictionReason) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        join_all(ids.iter().map(|id| self.evict(id, reason)))
            .await
            .into_iter()
            .filter(|evicted| *evicted)
            .count()
    }

    /// Refuse new sessions and stop every child.
    pub async fn shutdown(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let count = self.terminate_all(EvictionReason::Shutdown).await;
        tracing::info!(sessions = count, "all sessions terminated");
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// OS process ids of every live child.
    pub fn child_pids(&self) -> Vec<u32> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.live_record().and_then(|record| record.endpoint().pid()))
            .collect()
    }

    /// The live record for `session_id`, without leasing it.
    pub fn record(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.live_record().cloned())
    }

    async fn finish_eviction(&self, session_id: &str, cell: &SessionCell) {
        let reason = cell
            .evicted_as
            .get()
            .copied()
            .unwrap_or(EvictionReason::Explicit);
        match cell.live_record() {
            Some(record) => self.retire(record, reason).await,
            // The caller that is spawning it retires the child.
            None => tracing::debug!(session_id, reason = %reason, "session removed before its child started"),
        }
    }

    async fn retire(&self, record: &SessionRecord, reason: EvictionReason) {
        if !record.claim_retirement() {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_eviction(reason.label());
        }
        tracing::info!(
            session_id = record.session_id(),
            generation = record.generation(),
            reason = %reason,
            idle_ms = record.idle_for().as_millis() as u64,
            "session evicted"
        );
        record
            .endpoint()
            .terminate(reason.to_error(record.session_id()))
            .await;
    }
}
