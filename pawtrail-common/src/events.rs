//! Event types for the PawTrail event system
//!
//! Every lifecycle transition and tracking incident is published on the
//! [`EventBus`]. Delivery is at-least-once from the subscriber's point of view
//! (a restored session re-announces its state), so consumers de-duplicate
//! state notifications by `(session_id, state)`; see [`StateDeduplicator`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Actor, WalkState};

/// Walk tracking events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WalkEvent {
    /// Session entered a new lifecycle state
    ///
    /// `old_state` is None for the initial `requested` announcement.
    StateChanged {
        session_id: Uuid,
        old_state: Option<WalkState>,
        new_state: WalkState,
        actor: Actor,
        /// Cancellation reason code, None for other transitions
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Session loaded from the remote API on cold start
    SessionRestored {
        session_id: Uuid,
        state: WalkState,
        timestamp: DateTime<Utc>,
    },

    /// Server acknowledged samples and the route grew
    RouteExtended {
        session_id: Uuid,
        /// Samples appended by this acknowledgement
        appended: usize,
        last_captured_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Uplink gave up on a batch; the walk continues with a reporting gap
    UplinkWarning {
        session_id: Uuid,
        attempts: u32,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Location provider stopped delivering fixes
    TrackingDegraded {
        session_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Active session exceeded the sample timeout
    SessionStale {
        session_id: Uuid,
        last_sample_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },

    /// Terminal session handed to the history archive and dropped from the registry
    SessionArchived {
        session_id: Uuid,
        final_state: WalkState,
        timestamp: DateTime<Utc>,
    },
}

impl WalkEvent {
    /// Event type name, used as the SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            WalkEvent::StateChanged { .. } => "StateChanged",
            WalkEvent::SessionRestored { .. } => "SessionRestored",
            WalkEvent::RouteExtended { .. } => "RouteExtended",
            WalkEvent::UplinkWarning { .. } => "UplinkWarning",
            WalkEvent::TrackingDegraded { .. } => "TrackingDegraded",
            WalkEvent::SessionStale { .. } => "SessionStale",
            WalkEvent::SessionArchived { .. } => "SessionArchived",
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            WalkEvent::StateChanged { session_id, .. }
            | WalkEvent::SessionRestored { session_id, .. }
            | WalkEvent::RouteExtended { session_id, .. }
            | WalkEvent::UplinkWarning { session_id, .. }
            | WalkEvent::TrackingDegraded { session_id, .. }
            | WalkEvent::SessionStale { session_id, .. }
            | WalkEvent::SessionArchived { session_id, .. } => *session_id,
        }
    }
}

/// Broadcast bus for [`WalkEvent`]s
///
/// Cloning shares the underlying channel. Slow subscribers lose the oldest
/// events once `capacity` is exceeded (tokio broadcast semantics).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WalkEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<WalkEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: WalkEvent) -> Result<usize, broadcast::error::SendError<WalkEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: WalkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Subscriber-side filter that passes each `(session_id, state)` pair once
#[derive(Debug, Default)]
pub struct StateDeduplicator {
    seen: HashSet<(Uuid, WalkState)>,
}

impl StateDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time a session is seen in `state`
    pub fn first_seen(&mut self, session_id: Uuid, state: WalkState) -> bool {
        self.seen.insert((session_id, state))
    }

    /// Filter an event; non-state events always pass
    pub fn accept(&mut self, event: &WalkEvent) -> bool {
        match event {
            WalkEvent::StateChanged {
                session_id,
                new_state,
                ..
            } => self.first_seen(*session_id, *new_state),
            WalkEvent::SessionRestored {
                session_id, state, ..
            } => self.first_seen(*session_id, *state),
            _ => true,
        }
    }

    /// Drop bookkeeping for a session that left the registry
    pub fn forget(&mut self, session_id: Uuid) {
        self.seen.retain(|(id, _)| *id != session_id);
    }
}
