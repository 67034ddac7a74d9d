//! Walk session registry
//!
//! Table of in-flight walk sessions keyed by session id. The registry is an
//! ordinary value owned by the tracker context (tests build their own), not a
//! global. Reads are public; inserts and removals are crate-private so every
//! mutation goes through the state machine.
//!
//! Each entry carries its own lock, so transitions on one walk never wait on
//! another, plus the cancellation token that stops the walk's sampler and
//! uplink tasks when it reaches a terminal state.

use chrono::{DateTime, Utc};
use pawtrail_common::WalkSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, TrackerError};

/// Runtime tracking health for a session (not part of the walk record)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingStatus {
    /// Capture time of the newest sample committed to the buffer
    pub last_sample_at: Option<DateTime<Utc>>,
    /// When the newest sample was committed (wall clock)
    pub last_sample_committed_at: Option<DateTime<Utc>>,
    /// Sampler ended with `LocationUnavailable`
    pub location_lost: bool,
    /// Stale flag already raised for the current quiet period
    pub stale_flagged: bool,
    /// Batches that exhausted their retries
    pub uplink_failures: u32,
}

/// One registered walk
pub struct SessionEntry {
    session_id: Uuid,
    session: Mutex<WalkSession>,
    tracking: Mutex<TrackingStatus>,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn new(session: WalkSession, parent: &CancellationToken) -> Self {
        Self {
            session_id: session.session_id,
            session: Mutex::new(session),
            tracking: Mutex::new(TrackingStatus::default()),
            cancel: parent.child_token(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Copy of the current walk record
    pub async fn snapshot(&self) -> WalkSession {
        self.session.lock().await.clone()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, WalkSession> {
        self.session.lock().await
    }

    pub async fn tracking(&self) -> TrackingStatus {
        self.tracking.lock().await.clone()
    }

    pub(crate) async fn tracking_mut(&self) -> MutexGuard<'_, TrackingStatus> {
        self.tracking.lock().await
    }

    /// Cancelled once the walk is terminal (or the tracker shuts down)
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn stop_tasks(&self) {
        self.cancel.cancel();
    }
}

/// Process-wide table of in-flight walks
pub struct WalkSessionRegistry {
    entries: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
    /// Parent of every entry token; cancelled on teardown
    root: CancellationToken,
}

impl WalkSessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// Look up a session entry
    pub async fn get(&self, session_id: Uuid) -> Result<Arc<SessionEntry>> {
        self.entries
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(TrackerError::NotFound(session_id))
    }

    pub async fn contains(&self, session_id: Uuid) -> bool {
        self.entries.read().await.contains_key(&session_id)
    }

    /// Copy of one walk record
    pub async fn snapshot(&self, session_id: Uuid) -> Result<WalkSession> {
        Ok(self.get(session_id).await?.snapshot().await)
    }

    /// Copies of every registered walk, oldest request first
    pub async fn snapshots(&self) -> Vec<WalkSession> {
        let entries: Vec<Arc<SessionEntry>> = self.entries.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            sessions.push(entry.snapshot().await);
        }
        sessions.sort_by_key(|s| s.requested_at);
        sessions
    }

    pub async fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Register a new walk; fails if the id is already present
    pub(crate) async fn insert(&self, session: WalkSession) -> Result<Arc<SessionEntry>> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&session.session_id) {
            return Err(TrackerError::PreconditionFailed(format!(
                "walk {} is already registered",
                session.session_id
            )));
        }
        let entry = Arc::new(SessionEntry::new(session, &self.root));
        entries.insert(entry.session_id, entry.clone());
        Ok(entry)
    }

    /// Drop a walk, stopping its tasks
    pub(crate) async fn remove(&self, session_id: Uuid) -> Option<Arc<SessionEntry>> {
        let removed = self.entries.write().await.remove(&session_id);
        if let Some(entry) = &removed {
            entry.stop_tasks();
        }
        removed
    }

    /// Stop every walk's tasks and empty the table
    pub async fn teardown(&self) {
        self.root.cancel();
        let count = {
            let mut entries = self.entries.write().await;
            let count = entries.len();
            entries.clear();
            count
        };
        tracing::info!(sessions = count, "Walk session registry torn down");
    }
}

impl Default for WalkSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
