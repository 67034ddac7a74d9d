//! Staleness watchdog
//!
//! Periodically scans `active` walks. A walk with no committed sample for the
//! configured timeout is flagged once per quiet period. If its sampler has
//! also given up with `LocationUnavailable`, the walk is cancelled by the
//! system with reason `location_lost`.

use chrono::{DateTime, Utc};
use pawtrail_common::events::WalkEvent;
use pawtrail_common::{Actor, WalkState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::session::WalkSessionStateMachine;

pub const LOCATION_LOST_REASON: &str = "location_lost";

/// What one scan did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub flagged: Vec<Uuid>,
    pub cancelled: Vec<Uuid>,
}

pub struct StalenessWatchdog {
    machine: Arc<WalkSessionStateMachine>,
    timeout: Duration,
}

impl StalenessWatchdog {
    pub fn new(machine: Arc<WalkSessionStateMachine>, timeout: Duration) -> Self {
        Self { machine, timeout }
    }

    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            return Ok(report);
        };

        for entry in self.machine.registry().entries().await {
            let session = entry.snapshot().await;
            if session.state != WalkState::Active {
                continue;
            }

            let (last_sample_at, location_lost, newly_flagged) = {
                let mut tracking = entry.tracking_mut().await;
                let quiet_since = tracking
                    .last_sample_committed_at
                    .or(session.started_at)
                    .unwrap_or(session.requested_at);
                if now.signed_duration_since(quiet_since) < timeout {
                    continue;
                }
                let newly_flagged = !tracking.stale_flagged;
                tracking.stale_flagged = true;
                (tracking.last_sample_at, tracking.location_lost, newly_flagged)
            };

            if newly_flagged {
                tracing::warn!(
                    session_id = %session.session_id,
                    last_sample_at = ?last_sample_at,
                    "Active walk has stopped reporting location"
                );
                self.machine.events().emit_lossy(WalkEvent::SessionStale {
                    session_id: session.session_id,
                    last_sample_at,
                    timestamp: now,
                });
                report.flagged.push(session.session_id);
            }

            if location_lost {
                match self
                    .machine
                    .cancel_walk(session.session_id, Actor::System, LOCATION_LOST_REASON)
                    .await
                {
                    Ok(_) => report.cancelled.push(session.session_id),
                    // Lost a race with another transition
                    Err(e) => tracing::debug!(session_id = %session.session_id, "Watchdog cancel skipped: {}", e),
                }
            }
        }

        Ok(report)
    }

    /// Scan every `interval` until `cancel` fires
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(pawtrail_common::time::now()).await {
                        tracing::warn!(error = %e, "Staleness scan failed");
                    }
                }
            }
        }
    }
}
