//! Walk session state machine
//!
//! Owns the lifecycle of every walk in the registry:
//!
//! ```text
//! requested ──match──▶ matched ──start──▶ active ──end──▶ completed
//!     │                   │                 │
//!     └───────────────────┴─────cancel──────┴────────────▶ cancelled
//! ```
//!
//! Each transition validates the current state under the walk's own lock,
//! confirms the step with the remote API (transient failures retried with
//! backoff) with the lock released, re-validates, applies it, and publishes a
//! `StateChanged` event. Terminal states accept nothing further.

pub mod history;

use chrono::{DateTime, Utc};
use pawtrail_common::config::TrackingConfig;
use pawtrail_common::events::{EventBus, WalkEvent};
use pawtrail_common::{Actor, GeoPoint, LocationSample, WalkSession, WalkState};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::buffer::SampleBuffer;
use crate::error::{Result, TrackerError};
use crate::registry::{SessionEntry, WalkSessionRegistry};
use crate::remote::{CancelRequest, CreateWalkRequest, RemoteWalk, WalkApi};
use crate::uplink::backoff::{retry_remote, BackoffPolicy, Scheduler};
use history::HistoryArchive;

/// Lifecycle edges; anything else is an invalid transition
pub fn is_valid_transition(from: WalkState, to: WalkState) -> bool {
    use WalkState::*;
    matches!(
        (from, to),
        (Requested, Matched)
            | (Matched, Active)
            | (Active, Completed)
            | (Requested, Cancelled)
            | (Matched, Cancelled)
            | (Active, Cancelled)
    )
}

/// Guards taken from the tracking configuration
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Pickup confirmation radius in meters
    pub pickup_radius_m: f64,
    pub auto_start_on_pickup: bool,
}

impl From<&TrackingConfig> for LifecycleSettings {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            pickup_radius_m: config.pickup_radius_m,
            auto_start_on_pickup: config.auto_start_on_pickup,
        }
    }
}

/// Drives walk sessions through their lifecycle
pub struct WalkSessionStateMachine {
    registry: Arc<WalkSessionRegistry>,
    api: Arc<dyn WalkApi>,
    events: EventBus,
    policy: BackoffPolicy,
    scheduler: Arc<dyn Scheduler>,
    settings: LifecycleSettings,
    purge_on_cancel: Option<SampleBuffer>,
}

impl WalkSessionStateMachine {
    pub fn new(
        registry: Arc<WalkSessionRegistry>,
        api: Arc<dyn WalkApi>,
        events: EventBus,
        policy: BackoffPolicy,
        scheduler: Arc<dyn Scheduler>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            api,
            events,
            policy,
            scheduler,
            settings,
            purge_on_cancel: None,
        }
    }

    /// Delete a cancelled walk's unacknowledged samples instead of retaining them
    pub fn purge_on_cancel(mut self, buffer: SampleBuffer) -> Self {
        self.purge_on_cancel = Some(buffer);
        self
    }

    pub fn registry(&self) -> &Arc<WalkSessionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Current copy of a walk
    pub async fn session(&self, session_id: Uuid) -> Result<WalkSession> {
        self.registry.snapshot(session_id).await
    }

    /// Create a walk request (→ `requested`)
    pub async fn request_walk(
        &self,
        client_id: Uuid,
        pet_ids: BTreeSet<Uuid>,
        pickup: GeoPoint,
    ) -> Result<WalkSession> {
        if pet_ids.is_empty() {
            return Err(TrackerError::PreconditionFailed(
                "a walk needs at least one pet".to_string(),
            ));
        }
        if !pickup.is_valid() {
            return Err(TrackerError::PreconditionFailed(format!(
                "pickup location {:?} is not a valid coordinate",
                pickup
            )));
        }

        let requested_at = pawtrail_common::time::now();
        let request = CreateWalkRequest {
            client_id,
            pet_ids: pet_ids.iter().copied().collect(),
            pickup,
            requested_at,
        };

        let api = self.api.clone();
        let session_id = retry_remote(&self.policy, self.scheduler.as_ref(), Uuid::nil(), "create_walk", || {
            let api = api.clone();
            let request = request.clone();
            async move { api.create_walk(&request).await }
        })
        .await?;

        let session = WalkSession::new(session_id, client_id, pet_ids, pickup, requested_at);
        self.registry.insert(session.clone()).await?;

        tracing::info!(%session_id, %client_id, "Walk requested");
        self.publish(session_id, None, WalkState::Requested, Actor::Client, None);

        Ok(session)
    }

    /// Assign the walker chosen by the matching service (`requested` → `matched`)
    pub async fn assign_walker(&self, session_id: Uuid, walker_id: Uuid) -> Result<WalkSession> {
        let entry = self.registry.get(session_id).await?;
        self.guard_walker_unset(&*entry.lock().await)?;

        let api = self.api.clone();
        retry_remote(&self.policy, self.scheduler.as_ref(), session_id, "match_walker", || {
            let api = api.clone();
            async move { api.match_walker(session_id, walker_id).await }
        })
        .await?;

        let mut session = entry.lock().await;
        // A cancel may have landed while the server call was in flight
        self.guard_walker_unset(&session)?;
        let old = session.state;
        session.walker_id = Some(walker_id);
        session.state = WalkState::Matched;
        let snapshot = session.clone();
        drop(session);

        tracing::info!(%session_id, %walker_id, "Walker assigned");
        self.publish(session_id, Some(old), WalkState::Matched, Actor::System, None);
        Ok(snapshot)
    }

    /// Begin the walk (`matched` → `active`)
    ///
    /// Requires an acknowledged sample within the pickup radius.
    pub async fn start_walk(&self, session_id: Uuid) -> Result<WalkSession> {
        let entry = self.registry.get(session_id).await?;
        {
            let session = entry.lock().await;
            self.guard(&session, WalkState::Active)?;
            if !session.has_sample_near_pickup(self.settings.pickup_radius_m) {
                return Err(TrackerError::PreconditionFailed(format!(
                    "walker has not reported a position within {} m of the pickup address",
                    self.settings.pickup_radius_m
                )));
            }
        }

        let api = self.api.clone();
        retry_remote(&self.policy, self.scheduler.as_ref(), session_id, "start_walk", || {
            let api = api.clone();
            async move { api.start_walk(session_id).await }
        })
        .await?;

        let mut session = entry.lock().await;
        self.guard(&session, WalkState::Active)?;
        let old = session.state;
        session.state = WalkState::Active;
        session.started_at = Some(pawtrail_common::time::now());
        let snapshot = session.clone();
        drop(session);

        tracing::info!(%session_id, "Walk started");
        self.publish(session_id, Some(old), WalkState::Active, Actor::Walker, None);
        Ok(snapshot)
    }

    /// Finish the walk on the walker's signal (`active` → `completed`)
    ///
    /// `ended_at` is the time of this call, not the last sample's capture time.
    pub async fn end_walk(&self, session_id: Uuid) -> Result<WalkSession> {
        let called_at = pawtrail_common::time::now();
        let entry = self.registry.get(session_id).await?;
        self.guard(&*entry.lock().await, WalkState::Completed)?;

        let api = self.api.clone();
        retry_remote(&self.policy, self.scheduler.as_ref(), session_id, "end_walk", || {
            let api = api.clone();
            async move { api.end_walk(session_id).await }
        })
        .await?;

        let mut session = entry.lock().await;
        self.guard(&session, WalkState::Completed)?;
        let old = session.state;
        session.state = WalkState::Completed;
        session.ended_at = Some(called_at);
        let snapshot = session.clone();
        drop(session);

        entry.stop_tasks();
        tracing::info!(%session_id, route_samples = snapshot.route.len(), "Walk completed");
        self.publish(session_id, Some(old), WalkState::Completed, Actor::Walker, None);
        Ok(snapshot)
    }

    /// Cancel from any non-terminal state
    ///
    /// Applied locally first; the remote notification runs in the background
    /// and a failure there is published as a warning, not returned.
    pub async fn cancel_walk(&self, session_id: Uuid, actor: Actor, reason: &str) -> Result<WalkSession> {
        let entry = self.registry.get(session_id).await?;
        let mut session = entry.lock().await;
        self.guard(&session, WalkState::Cancelled)?;

        let old = session.state;
        session.state = WalkState::Cancelled;
        session.ended_at = Some(pawtrail_common::time::now());
        let snapshot = session.clone();
        drop(session);

        entry.stop_tasks();
        tracing::info!(%session_id, %actor, reason, from = %old, "Walk cancelled");

        if let Some(buffer) = &self.purge_on_cancel {
            match buffer.purge(session_id).await {
                Ok(purged) => tracing::info!(%session_id, purged, "Unacknowledged samples purged"),
                Err(e) => tracing::warn!(%session_id, error = %e, "Failed to purge samples of cancelled walk"),
            }
        }
        self.publish(
            session_id,
            Some(old),
            WalkState::Cancelled,
            actor,
            Some(reason.to_string()),
        );

        self.notify_cancel(session_id, CancelRequest {
            actor,
            reason: reason.to_string(),
        });

        Ok(snapshot)
    }

    fn notify_cancel(&self, session_id: Uuid, request: CancelRequest) {
        let api = self.api.clone();
        let policy = self.policy.clone();
        let scheduler = self.scheduler.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = retry_remote(&policy, scheduler.as_ref(), session_id, "cancel_walk", || {
                let api = api.clone();
                let request = request.clone();
                async move { api.cancel_walk(session_id, &request).await }
            })
            .await;

            if let Err(e) = result {
                tracing::warn!(%session_id, error = %e, "Server was not told about cancellation");
                events.emit_lossy(WalkEvent::UplinkWarning {
                    session_id,
                    attempts: match &e {
                        TrackerError::PermanentFailure { attempts, .. } => *attempts,
                        _ => 1,
                    },
                    message: format!("cancel notification failed: {}", e),
                    timestamp: pawtrail_common::time::now(),
                });
            }
        });
    }

    /// Append server-acknowledged samples to the walk's route
    ///
    /// Returns how many samples were appended. With auto-start enabled, a
    /// matched walk whose route now confirms pickup is started.
    pub async fn record_acknowledged(&self, session_id: Uuid, samples: Vec<LocationSample>) -> Result<usize> {
        let entry = self.registry.get(session_id).await?;
        let mut session = entry.lock().await;

        let mut appended = 0;
        for sample in samples {
            if session.append_route(sample) {
                appended += 1;
            }
        }

        let last_captured_at = session.last_route_time();
        let should_start = self.settings.auto_start_on_pickup
            && session.state == WalkState::Matched
            && session.has_sample_near_pickup(self.settings.pickup_radius_m);
        drop(session);

        if let (true, Some(last_captured_at)) = (appended > 0, last_captured_at) {
            self.events.emit_lossy(WalkEvent::RouteExtended {
                session_id,
                appended,
                last_captured_at,
                timestamp: pawtrail_common::time::now(),
            });
        }

        if should_start {
            match self.start_walk(session_id).await {
                Ok(_) => tracing::info!(%session_id, "Walk auto-started on pickup confirmation"),
                Err(e) => tracing::warn!(%session_id, error = %e, "Auto-start failed"),
            }
        }

        Ok(appended)
    }

    /// Record that the sampler committed a sample to the buffer
    pub async fn note_sample_committed(&self, session_id: Uuid, captured_at: DateTime<Utc>) -> Result<()> {
        let entry = self.registry.get(session_id).await?;
        let mut tracking = entry.tracking_mut().await;
        tracking.last_sample_at = Some(captured_at);
        tracking.last_sample_committed_at = Some(pawtrail_common::time::now());
        tracking.location_lost = false;
        tracking.stale_flagged = false;
        Ok(())
    }

    /// Uplink exhausted its retries; the walk goes on with a reporting gap
    pub async fn report_uplink_failure(&self, session_id: Uuid, attempts: u32, message: &str) -> Result<()> {
        let entry = self.registry.get(session_id).await?;
        entry.tracking_mut().await.uplink_failures += 1;

        tracing::warn!(%session_id, attempts, detail = message, "Location reporting gap: uplink gave up on batch");
        self.events.emit_lossy(WalkEvent::UplinkWarning {
            session_id,
            attempts,
            message: message.to_string(),
            timestamp: pawtrail_common::time::now(),
        });
        Ok(())
    }

    /// Location provider failed; the watchdog decides about cancellation
    pub async fn report_location_unavailable(&self, session_id: Uuid, message: &str) -> Result<()> {
        let entry = self.registry.get(session_id).await?;
        entry.tracking_mut().await.location_lost = true;

        tracing::warn!(%session_id, detail = message, "Location tracking degraded");
        self.events.emit_lossy(WalkEvent::TrackingDegraded {
            session_id,
            message: message.to_string(),
            timestamp: pawtrail_common::time::now(),
        });
        Ok(())
    }

    /// Rebuild registry entries from the server's in-flight walks
    ///
    /// Terminal walks and walks already registered are skipped. Returns the
    /// ids that were added.
    pub async fn restore(&self, walks: Vec<RemoteWalk>) -> Vec<Uuid> {
        let mut restored = Vec::new();

        for walk in walks {
            if walk.state.is_terminal() {
                continue;
            }
            if walk.pet_ids.is_empty() {
                tracing::warn!(session_id = %walk.session_id, "Skipping restored walk without pets");
                continue;
            }

            let mut session = WalkSession::new(
                walk.session_id,
                walk.client_id,
                walk.pet_ids.into_iter().collect(),
                walk.pickup,
                walk.requested_at,
            );
            session.walker_id = walk.walker_id;
            session.state = walk.state;
            session.started_at = walk.started_at;
            session.ended_at = walk.ended_at;

            match self.registry.insert(session).await {
                Ok(_) => {
                    tracing::info!(session_id = %walk.session_id, state = %walk.state, "Walk restored");
                    self.events.emit_lossy(WalkEvent::SessionRestored {
                        session_id: walk.session_id,
                        state: walk.state,
                        timestamp: pawtrail_common::time::now(),
                    });
                    restored.push(walk.session_id);
                }
                Err(e) => tracing::debug!(session_id = %walk.session_id, "Not restoring walk: {}", e),
            }
        }

        restored
    }

    /// Archive and drop terminal walks whose retention window has passed
    pub async fn reap_terminal(
        &self,
        archive: &dyn HistoryArchive,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| TrackerError::Config(format!("retention out of range: {}", e)))?;
        let mut reaped = Vec::new();

        for entry in self.registry.entries().await {
            let session = entry.snapshot().await;
            let expired = match (session.is_terminal(), session.ended_at) {
                (true, Some(ended_at)) => ended_at
                    .checked_add_signed(retention)
                    .map_or(false, |expires_at| expires_at <= now),
                _ => false,
            };
            if !expired {
                continue;
            }

            archive.archive(&session).await?;
            self.registry.remove(session.session_id).await;
            self.events.emit_lossy(WalkEvent::SessionArchived {
                session_id: session.session_id,
                final_state: session.state,
                timestamp: now,
            });
            tracing::debug!(session_id = %session.session_id, "Terminal walk archived and removed");
            reaped.push(session.session_id);
        }

        Ok(reaped)
    }

    /// Entry handle for task wiring
    pub async fn entry(&self, session_id: Uuid) -> Result<Arc<SessionEntry>> {
        self.registry.get(session_id).await
    }

    /// `walker_id` is write-once
    fn guard_walker_unset(&self, session: &WalkSession) -> Result<()> {
        self.guard(session, WalkState::Matched)?;
        if session.walker_id.is_some() {
            return Err(TrackerError::InvalidTransition {
                session_id: session.session_id,
                from: session.state,
                attempted: WalkState::Matched,
            });
        }
        Ok(())
    }

    fn guard(&self, session: &WalkSession, attempted: WalkState) -> Result<()> {
        if is_valid_transition(session.state, attempted) {
            Ok(())
        } else {
            tracing::debug!(
                session_id = %session.session_id,
                from = %session.state,
                attempted = %attempted,
                "Rejected invalid transition"
            );
            Err(TrackerError::InvalidTransition {
                session_id: session.session_id,
                from: session.state,
                attempted,
            })
        }
    }

    fn publish(
        &self,
        session_id: Uuid,
        old_state: Option<WalkState>,
        new_state: WalkState,
        actor: Actor,
        reason: Option<String>,
    ) {
        self.events.emit_lossy(WalkEvent::StateChanged {
            session_id,
            old_state,
            new_state,
            actor,
            reason,
            timestamp: pawtrail_common::time::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WalkState; 5] = [
        WalkState::Requested,
        WalkState::Matched,
        WalkState::Active,
        WalkState::Completed,
        WalkState::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in [WalkState::Completed, WalkState::Cancelled] {
            for to in ALL {
                assert!(!is_valid_transition(from, to), "{} -> {} should be invalid", from, to);
            }
        }
    }

    #[test]
    fn test_cancel_reachable_from_every_non_terminal_state() {
        for from in [WalkState::Requested, WalkState::Matched, WalkState::Active] {
            assert!(is_valid_transition(from, WalkState::Cancelled));
        }
    }

    #[test]
    fn test_no_self_loops_or_backward_edges() {
        for (i, from) in ALL.iter().enumerate() {
            for to in ALL.iter().take(i + 1) {
                assert!(!is_valid_transition(*from, *to), "{} -> {} should be invalid", from, to);
            }
        }
    }

    #[test]
    fn test_every_valid_path_visits_each_state_once() {
        // Walk every path from `requested` and check no state repeats
        fn explore(path: &mut Vec<WalkState>) {
            let current = *path.last().unwrap();
            for next in ALL {
                if is_valid_transition(current, next) {
                    assert!(!path.contains(&next), "path {:?} revisits {}", path, next);
                    path.push(next);
                    explore(path);
                    path.pop();
                }
            }
        }
        explore(&mut vec![WalkState::Requested]);
    }

    #[test]
    fn test_forward_edges() {
        assert!(is_valid_transition(WalkState::Requested, WalkState::Matched));
        assert!(is_valid_transition(WalkState::Matched, WalkState::Active));
        assert!(is_valid_transition(WalkState::Active, WalkState::Completed));
        assert!(!is_valid_transition(WalkState::Requested, WalkState::Active));
        assert!(!is_valid_transition(WalkState::Matched, WalkState::Completed));
    }
}
