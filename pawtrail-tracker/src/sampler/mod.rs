//! Location sampling
//!
//! A [`LocationSampler`] turns a [`LocationProvider`] into a lazy stream of
//! [`LocationSample`]s for one session. The stream suspends on every provider
//! callback and between samples; the pause length follows the app's
//! foreground/background mode and a mode change wakes it early.
//!
//! The stream ends quietly when its cancellation token fires, and ends with
//! `LocationUnavailable` when the provider fails. Restarting means building a
//! new stream with the last committed capture time, so capture times stay
//! strictly increasing across restarts.

mod channel;

pub use channel::{ChannelProvider, ProviderHandle};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use pawtrail_common::config::TrackingConfig;
use pawtrail_common::{GeoPoint, LocationSample};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, TrackerError};

/// Application visibility, which selects the sampling interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppMode {
    #[default]
    Foreground,
    Background,
}

/// Position as delivered by the platform
#[derive(Debug, Clone, PartialEq)]
pub struct RawFix {
    pub position: GeoPoint,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Source of position fixes
///
/// `next_fix` suspends until the platform delivers a fix. Errors (permission
/// revoked, hardware off) are reported as `TrackerError::LocationUnavailable`.
#[async_trait]
pub trait LocationProvider: Send {
    async fn next_fix(&mut self) -> Result<RawFix>;
}

/// Cadence settings
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    /// Fixes closer than this to the previous sample are skipped (0 = off)
    pub min_distance_m: f64,
}

impl SamplerSettings {
    pub fn interval_for(&self, mode: AppMode) -> Duration {
        match mode {
            AppMode::Foreground => self.foreground_interval,
            AppMode::Background => self.background_interval,
        }
    }
}

impl From<&TrackingConfig> for SamplerSettings {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            foreground_interval: config.foreground_interval(),
            background_interval: config.background_interval(),
            min_distance_m: config.min_distance_m,
        }
    }
}

/// Builds per-session sample streams
#[derive(Debug, Clone)]
pub struct LocationSampler {
    settings: SamplerSettings,
    mode: watch::Receiver<AppMode>,
}

impl LocationSampler {
    pub fn new(settings: SamplerSettings, mode: watch::Receiver<AppMode>) -> Self {
        Self { settings, mode }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn mode(&self) -> AppMode {
        *self.mode.borrow()
    }

    /// Sample stream for `session_id`
    ///
    /// Fixes not strictly newer (at millisecond precision) than `resume_after`
    /// or the previous sample are dropped, as are fixes within
    /// `min_distance_m` of the previous sample.
    pub fn stream<P>(
        &self,
        session_id: Uuid,
        mut provider: P,
        resume_after: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<LocationSample>> + Send + 'static
    where
        P: LocationProvider + 'static,
    {
        let settings = self.settings.clone();
        let mut mode = self.mode.clone();

        async_stream::stream! {
            let mut last_captured = resume_after;
            let mut last_position: Option<GeoPoint> = None;
            let mut mode_open = true;

            tracing::debug!(%session_id, mode = ?*mode.borrow(), "Sampler started");

            loop {
                let fix = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fix = provider.next_fix() => fix,
                };

                let fix = match fix {
                    Ok(fix) => fix,
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "Location provider failed, sampler stopping");
                        yield Err(match e {
                            TrackerError::LocationUnavailable(_) => e,
                            other => TrackerError::LocationUnavailable(other.to_string()),
                        });
                        break;
                    }
                };

                let sample = LocationSample::new(session_id, fix.position, fix.accuracy, fix.timestamp);

                let in_order = last_captured.map_or(true, |last| sample.captured_at > last);
                let moved = match last_position {
                    Some(prev) if settings.min_distance_m > 0.0 => {
                        prev.distance_m(&fix.position) >= settings.min_distance_m
                    }
                    _ => true,
                };

                if !fix.position.is_valid() {
                    tracing::debug!(%session_id, "Dropping fix with invalid coordinates");
                } else if !in_order {
                    tracing::trace!(%session_id, captured_at = %sample.captured_at, "Dropping out-of-order fix");
                } else if !moved {
                    tracing::trace!(%session_id, "Dropping fix inside minimum distance");
                } else {
                    last_captured = Some(sample.captured_at);
                    last_position = Some(fix.position);
                    yield Ok(sample);
                }

                let interval = settings.interval_for(*mode.borrow_and_update());
                if mode_open {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                        changed = mode.changed() => {
                            match changed {
                                Ok(()) => tracing::debug!(%session_id, mode = ?*mode.borrow(), "App mode changed"),
                                Err(_) => mode_open = false,
                            }
                        }
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }

            tracing::debug!(%session_id, "Sampler stopped");
        }
    }
}
