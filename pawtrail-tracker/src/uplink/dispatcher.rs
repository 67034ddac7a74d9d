//! Per-session upload dispatch
//!
//! At most one [`UploadTask`] per session is in flight: a second dispatch for
//! a session that is already uploading (or backing off) returns
//! [`DispatchOutcome::Busy`]. Samples leave the buffer only after the server
//! acknowledges them, and an acknowledgement is never applied past the end of
//! the batch that was sent.

use chrono::{DateTime, Utc};
use pawtrail_common::LocationSample;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backoff::{BackoffPolicy, Scheduler};
use crate::buffer::SampleBuffer;
use crate::error::{Result, TrackerError};
use crate::remote::{SamplePayload, WalkApi};
use crate::session::WalkSessionStateMachine;

/// One batch on its way to the server
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub session_id: Uuid,
    /// Oldest unacknowledged samples, in capture order
    pub batch: Vec<LocationSample>,
    /// Attempts made so far
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    fn new(session_id: Uuid, batch: Vec<LocationSample>) -> Self {
        Self {
            session_id,
            batch,
            attempt: 0,
            next_retry_at: None,
        }
    }

    fn last_captured_at(&self) -> Option<DateTime<Utc>> {
        self.batch.last().map(|s| s.captured_at)
    }
}

/// Result of a single dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing buffered for the session
    Idle,
    /// Another upload for the session is in flight
    Busy,
    /// Server answered; `acknowledged` samples left the buffer
    Delivered { acknowledged: u64, appended: usize },
    /// Cancellation fired mid-upload; samples stay buffered
    Abandoned,
}

pub struct UplinkDispatcher {
    buffer: SampleBuffer,
    api: Arc<dyn WalkApi>,
    machine: Arc<WalkSessionStateMachine>,
    policy: BackoffPolicy,
    scheduler: Arc<dyn Scheduler>,
    batch_size: usize,
    poll_interval: Duration,
    in_flight: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UplinkDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: SampleBuffer,
        api: Arc<dyn WalkApi>,
        machine: Arc<WalkSessionStateMachine>,
        policy: BackoffPolicy,
        scheduler: Arc<dyn Scheduler>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            buffer,
            api,
            machine,
            policy,
            scheduler,
            batch_size: batch_size.max(1),
            poll_interval,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    async fn session_slot(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .await
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-session slot once a session is gone for good
    pub async fn forget(&self, session_id: Uuid) {
        self.in_flight.lock().await.remove(&session_id);
    }

    /// Upload the session's oldest batch, retrying transient failures
    ///
    /// Exhausting the retry budget (or a rejection by the server) reports a
    /// reporting gap to the state machine, keeps the samples buffered, and
    /// returns `PermanentFailure`. The walk itself is left alone.
    pub async fn dispatch_once(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<DispatchOutcome> {
        let slot = self.session_slot(session_id).await;
        let _in_flight = match slot.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return Ok(DispatchOutcome::Busy),
        };
        self.upload_oldest(session_id, cancel).await
    }

    async fn upload_oldest(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<DispatchOutcome> {
        let batch = self.buffer.dequeue_batch(session_id, self.batch_size).await?;
        if batch.is_empty() {
            return Ok(DispatchOutcome::Idle);
        }

        let mut task = UploadTask::new(session_id, batch);
        let payload: Vec<SamplePayload> = task.batch.iter().map(SamplePayload::from).collect();

        loop {
            task.attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(%session_id, attempt = task.attempt, "Upload abandoned");
                    return Ok(DispatchOutcome::Abandoned);
                }
                result = self.api.upload_locations(session_id, &payload) => result,
            };

            match result {
                Ok(acknowledged_up_to) => return self.complete(&task, acknowledged_up_to).await,
                Err(e) if e.is_transient() && !self.policy.is_exhausted(task.attempt) => {
                    let delay = self.policy.next_delay(task.attempt);
                    task.next_retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| pawtrail_common::time::now() + d);
                    tracing::warn!(
                        %session_id,
                        attempt = task.attempt,
                        batch = task.batch.len(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload failed, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(%session_id, "Upload abandoned during backoff");
                            return Ok(DispatchOutcome::Abandoned);
                        }
                        _ = self.scheduler.sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(
                        %session_id,
                        attempts = task.attempt,
                        batch = task.batch.len(),
                        error = %message,
                        "Upload batch failed permanently; samples kept in buffer"
                    );
                    if let Err(report) = self
                        .machine
                        .report_uplink_failure(session_id, task.attempt, &message)
                        .await
                    {
                        tracing::debug!(%session_id, "Could not report uplink failure: {}", report);
                    }
                    return Err(TrackerError::PermanentFailure {
                        session_id,
                        attempts: task.attempt,
                        last_error: message,
                    });
                }
            }
        }
    }

    async fn complete(&self, task: &UploadTask, acknowledged_up_to: Option<DateTime<Utc>>) -> Result<DispatchOutcome> {
        let session_id = task.session_id;
        let (Some(up_to), Some(batch_end)) = (acknowledged_up_to, task.last_captured_at()) else {
            tracing::debug!(%session_id, "Server acknowledged nothing from batch");
            return Ok(DispatchOutcome::Delivered {
                acknowledged: 0,
                appended: 0,
            });
        };

        let up_to = up_to.min(batch_end);
        let acknowledged = self.buffer.acknowledge(session_id, up_to).await?;
        let confirmed: Vec<LocationSample> = task
            .batch
            .iter()
            .filter(|s| s.captured_at <= up_to)
            .cloned()
            .collect();

        let appended = match self.machine.record_acknowledged(session_id, confirmed).await {
            Ok(n) => n,
            Err(TrackerError::NotFound(_)) => {
                tracing::debug!(%session_id, "Acknowledged samples for a session no longer registered");
                0
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(%session_id, acknowledged, appended, attempts = task.attempt, "Batch delivered");
        Ok(DispatchOutcome::Delivered { acknowledged, appended })
    }

    /// Dispatch loop for one session until `cancel` fires
    ///
    /// Drains eagerly while the server makes progress, then waits for a wake
    /// from the sampler pipeline or the poll interval.
    pub async fn run_session(&self, session_id: Uuid, wake: Arc<Notify>, cancel: CancellationToken) {
        tracing::debug!(%session_id, "Uplink started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.dispatch_once(session_id, &cancel).await {
                Ok(DispatchOutcome::Delivered { acknowledged, .. }) if acknowledged > 0 => continue,
                Ok(DispatchOutcome::Abandoned) => break,
                Ok(_) => {}
                Err(TrackerError::PermanentFailure { .. }) => {}
                Err(e) => tracing::warn!(%session_id, error = %e, "Uplink dispatch error"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::debug!(%session_id, "Uplink stopped");
    }

    /// Upload samples retained after cancellation
    ///
    /// Runs until the session's buffer is empty or an upload fails; returns
    /// the number of samples acknowledged.
    pub async fn flush_retained(&self, session_id: Uuid) -> Result<u64> {
        let total = self.drain(session_id, &CancellationToken::new()).await?;
        tracing::info!(%session_id, acknowledged = total, "Retained samples flushed");
        Ok(total)
    }

    /// Upload everything buffered for the session, stopping early on `cancel`
    ///
    /// Waits for an upload already in flight to finish first.
    pub async fn drain(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<u64> {
        let slot = self.session_slot(session_id).await;
        let _in_flight = tokio::select! {
            _ = cancel.cancelled() => return Ok(0),
            guard = slot.lock_owned() => guard,
        };
        let mut total = 0;

        loop {
            match self.upload_oldest(session_id, cancel).await? {
                DispatchOutcome::Delivered { acknowledged, .. } if acknowledged > 0 => total += acknowledged,
                _ => break,
            }
        }

        Ok(total)
    }
}
