//! Tracker context
//!
//! [`WalkTracker`] wires the registry, state machine, sample buffer and
//! uplink together and owns their background tasks. It is an ordinary value:
//! the binary builds one at startup and tears it down at shutdown, tests build
//! as many isolated instances as they need.

use futures::StreamExt;
use pawtrail_common::config::{CancelPolicy, TomlConfig};
use pawtrail_common::events::{EventBus, WalkEvent};
use pawtrail_common::WalkState;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::SampleBuffer;
use crate::error::{Result, TrackerError};
use crate::registry::WalkSessionRegistry;
use crate::remote::WalkApi;
use crate::sampler::{AppMode, LocationProvider, LocationSampler, SamplerSettings};
use crate::session::history::{HistoryArchive, SqliteHistoryArchive};
use crate::session::{LifecycleSettings, WalkSessionStateMachine};
use crate::uplink::backoff::retry_remote;
use crate::uplink::{BackoffPolicy, Scheduler, TokioScheduler, UplinkDispatcher};
use crate::watchdog::StalenessWatchdog;

/// Event channel capacity
const EVENT_CAPACITY: usize = 256;

/// Outcome of cold-start recovery
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Walks re-registered from the server
    pub restored: Vec<Uuid>,
    /// Walks whose buffered samples are being uploaded again
    pub resumed: Vec<Uuid>,
    /// Buffered samples belonging to walks that are no longer in flight
    pub orphaned: Vec<Uuid>,
}

pub struct WalkTracker {
    machine: Arc<WalkSessionStateMachine>,
    dispatcher: Arc<UplinkDispatcher>,
    buffer: SampleBuffer,
    api: Arc<dyn WalkApi>,
    archive: Arc<dyn HistoryArchive>,
    policy: BackoffPolicy,
    scheduler: Arc<dyn Scheduler>,
    sampler: LocationSampler,
    mode_tx: watch::Sender<AppMode>,
    account_id: Option<Uuid>,
    retention: Duration,
    reap_interval: Duration,
    sample_timeout: Duration,
    uplinks: Arc<Mutex<HashMap<Uuid, Arc<Notify>>>>,
    samplers: Arc<Mutex<HashSet<Uuid>>>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WalkTracker {
    /// Build a tracker with real timers and the SQLite history archive
    pub fn init(config: &TomlConfig, pool: SqlitePool, api: Arc<dyn WalkApi>) -> Self {
        let archive = Arc::new(SqliteHistoryArchive::new(pool.clone()));
        Self::with_parts(config, pool, api, Arc::new(TokioScheduler), archive)
    }

    /// Build a tracker with an explicit scheduler and history archive
    pub fn with_parts(
        config: &TomlConfig,
        pool: SqlitePool,
        api: Arc<dyn WalkApi>,
        scheduler: Arc<dyn Scheduler>,
        archive: Arc<dyn HistoryArchive>,
    ) -> Self {
        let registry = Arc::new(WalkSessionRegistry::new());
        let events = EventBus::new(EVENT_CAPACITY);
        let policy = BackoffPolicy::from_config(&config.uplink);
        let buffer = SampleBuffer::new(pool, config.buffer.max_samples);

        let mut machine = WalkSessionStateMachine::new(
            registry,
            api.clone(),
            events,
            policy.clone(),
            scheduler.clone(),
            LifecycleSettings::from(&config.tracking),
        );
        if config.buffer.cancel_policy == CancelPolicy::Purge {
            machine = machine.purge_on_cancel(buffer.clone());
        }
        let machine = Arc::new(machine);

        let dispatcher = Arc::new(UplinkDispatcher::new(
            buffer.clone(),
            api.clone(),
            machine.clone(),
            policy.clone(),
            scheduler.clone(),
            config.uplink.batch_size,
            pawtrail_common::time::millis_to_duration(config.uplink.poll_interval_ms),
        ));

        let (mode_tx, mode_rx) = watch::channel(AppMode::Foreground);
        let sampler = LocationSampler::new(SamplerSettings::from(&config.tracking), mode_rx);

        tracing::debug!(
            cancel_policy = ?config.buffer.cancel_policy,
            pickup_radius_m = config.tracking.pickup_radius_m,
            "Walk tracker initialized"
        );

        Self {
            machine,
            dispatcher,
            buffer,
            api,
            archive,
            policy,
            scheduler,
            sampler,
            mode_tx,
            account_id: config.account_id,
            retention: Duration::from_secs(config.registry.retention_secs),
            reap_interval: Duration::from_secs(config.registry.reap_interval_secs.max(1)),
            sample_timeout: config.tracking.sample_timeout(),
            uplinks: Arc::new(Mutex::new(HashMap::new())),
            samplers: Arc::new(Mutex::new(HashSet::new())),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn machine(&self) -> &Arc<WalkSessionStateMachine> {
        &self.machine
    }

    pub fn registry(&self) -> &Arc<WalkSessionRegistry> {
        self.machine.registry()
    }

    pub fn events(&self) -> &EventBus {
        self.machine.events()
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn dispatcher(&self) -> &Arc<UplinkDispatcher> {
        &self.dispatcher
    }

    /// Switch sampling cadence for every running sampler
    pub fn set_app_mode(&self, mode: AppMode) {
        let previous = self.mode_tx.send_replace(mode);
        if previous != mode {
            tracing::info!(?mode, "App mode changed");
        }
    }

    pub fn app_mode(&self) -> AppMode {
        *self.mode_tx.borrow()
    }

    /// Start sampling and uploading for a `matched` or `active` walk
    ///
    /// Sampling resumes after the newest sample already buffered or routed,
    /// so a restarted sampler never produces an out-of-order capture time.
    pub async fn start_tracking<P>(&self, session_id: Uuid, provider: P) -> Result<()>
    where
        P: LocationProvider + 'static,
    {
        let entry = self.machine.entry(session_id).await?;
        let session = entry.snapshot().await;
        if !matches!(session.state, WalkState::Matched | WalkState::Active) {
            return Err(TrackerError::PreconditionFailed(format!(
                "walk {} is {}; tracking needs a matched or active walk",
                session_id, session.state
            )));
        }

        let buffered = self.buffer.newest_captured_at(session_id).await?;
        let resume_after = buffered.max(session.last_route_time());
        let wake = self.ensure_uplink(session_id).await?;

        if !self.samplers.lock().await.insert(session_id) {
            return Err(TrackerError::PreconditionFailed(format!(
                "walk {} is already being tracked",
                session_id
            )));
        }

        let cancel = entry.cancellation();
        let stream = self.sampler.stream(session_id, provider, resume_after, cancel);
        let machine = self.machine.clone();
        let buffer = self.buffer.clone();
        let samplers = self.samplers.clone();

        let handle = tokio::spawn(async move {
            let mut stream = Box::pin(stream);

            while let Some(item) = stream.next().await {
                match item {
                    Ok(sample) => match buffer.enqueue(&sample).await {
                        Ok(_) => {
                            if let Err(e) = machine.note_sample_committed(session_id, sample.captured_at).await {
                                tracing::debug!(%session_id, "Sample committed for unregistered walk: {}", e);
                            }
                            wake.notify_one();
                        }
                        Err(e) => {
                            let full = matches!(e, TrackerError::BufferFull(_));
                            if full {
                                tracing::error!(%session_id, error = %e, "Sample buffer exhausted, stopping sampler");
                            } else {
                                tracing::warn!(%session_id, error = %e, "Sample dropped, buffer write failed");
                            }
                            machine.events().emit_lossy(WalkEvent::TrackingDegraded {
                                session_id,
                                message: e.to_string(),
                                timestamp: pawtrail_common::time::now(),
                            });
                            if full {
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        if let Err(report) = machine.report_location_unavailable(session_id, &e.to_string()).await {
                            tracing::debug!(%session_id, "Could not report lost location: {}", report);
                        }
                    }
                }
            }

            samplers.lock().await.remove(&session_id);
        });
        self.track(handle).await;

        tracing::info!(%session_id, state = %session.state, resume_after = ?resume_after, "Tracking started");
        Ok(())
    }

    pub async fn is_tracking(&self, session_id: Uuid) -> bool {
        self.samplers.lock().await.contains(&session_id)
    }

    /// Make sure an uplink loop runs for the session; returns its wake handle
    async fn ensure_uplink(&self, session_id: Uuid) -> Result<Arc<Notify>> {
        let entry = self.machine.entry(session_id).await?;
        let mut uplinks = self.uplinks.lock().await;
        if let Some(wake) = uplinks.get(&session_id) {
            return Ok(wake.clone());
        }

        let wake = Arc::new(Notify::new());
        uplinks.insert(session_id, wake.clone());
        drop(uplinks);

        let dispatcher = self.dispatcher.clone();
        let machine = self.machine.clone();
        let uplinks = self.uplinks.clone();
        let loop_wake = wake.clone();
        let cancel = entry.cancellation();
        let shutdown = self.background.clone();

        let handle = tokio::spawn(async move {
            dispatcher.run_session(session_id, loop_wake, cancel).await;
            uplinks.lock().await.remove(&session_id);

            // A completed walk still uploads its tail; a cancelled one follows the cancel policy
            let completed = matches!(
                machine.session(session_id).await.map(|s| s.state),
                Ok(WalkState::Completed)
            );
            if completed {
                match dispatcher.drain(session_id, &shutdown).await {
                    Ok(acknowledged) => tracing::debug!(%session_id, acknowledged, "Final samples uploaded"),
                    Err(e) => tracing::warn!(%session_id, error = %e, "Final samples left in buffer"),
                }
            }
        });
        self.track(handle).await;

        Ok(wake)
    }

    /// Keep a spawned task for shutdown, dropping handles of tasks already done
    async fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Number of spawned tasks still running
    pub async fn running_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.len()
    }

    /// Upload samples kept after a walk was cancelled
    pub async fn flush_retained(&self, session_id: Uuid) -> Result<u64> {
        self.dispatcher.flush_retained(session_id).await
    }

    /// Rebuild the registry from the server and resume pending uploads
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        if let Some(account_id) = self.account_id {
            let api = self.api.clone();
            let walks = retry_remote(&self.policy, self.scheduler.as_ref(), Uuid::nil(), "list_in_flight", || {
                let api = api.clone();
                async move { api.list_in_flight(account_id).await }
            })
            .await?;
            report.restored = self.machine.restore(walks).await;
        } else {
            tracing::info!("No account configured, skipping registry rebuild");
        }

        for session_id in self.buffer.pending_sessions().await? {
            let resumable = match self.machine.session(session_id).await {
                Ok(session) => !session.is_terminal(),
                Err(_) => false,
            };
            if resumable {
                self.ensure_uplink(session_id).await?;
                report.resumed.push(session_id);
            } else {
                report.orphaned.push(session_id);
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            resumed = report.resumed.len(),
            orphaned = report.orphaned.len(),
            "Cold-start recovery complete"
        );
        Ok(report)
    }

    /// Spawn the retention reaper and staleness watchdog
    pub async fn start_background(&self) {
        let machine = self.machine.clone();
        let dispatcher = self.dispatcher.clone();
        let archive = self.archive.clone();
        let retention = self.retention;
        let interval = self.reap_interval;
        let cancel = self.background.clone();

        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match machine.reap_terminal(archive.as_ref(), retention, pawtrail_common::time::now()).await {
                            Ok(reaped) => {
                                for session_id in reaped {
                                    dispatcher.forget(session_id).await;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "Retention reap failed"),
                        }
                    }
                }
            }
        });

        let watchdog = StalenessWatchdog::new(self.machine.clone(), self.sample_timeout);
        // Check a few times per timeout window
        let scan_every = (self.sample_timeout / 4).max(Duration::from_secs(1));
        let cancel = self.background.clone();
        let watchdog = tokio::spawn(async move { watchdog.run(scan_every, cancel).await });

        self.track(reaper).await;
        self.track(watchdog).await;
    }

    /// Stop every task and clear the registry
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.registry().teardown().await;

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Tracker task ended abnormally: {}", e);
            }
        }
        tracing::info!("Walk tracker stopped");
    }
}
