//! Exponential backoff
//!
//! The policy is a pure function of the attempt number (plus an explicit
//! jitter input), and waiting goes through a [`Scheduler`], so retry timing is
//! testable without real timers.

use async_trait::async_trait;
use pawtrail_common::config::UplinkConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TrackerError;
use crate::remote::RemoteError;

/// Retry timing: base delay doubling per attempt, capped, plus jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts (first try included) before giving up
    pub max_attempts: u32,
    /// Upper bound of the added jitter as a fraction of the capped delay
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &UplinkConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// `jitter` is a unit value in `[0, 1]`; the result is
    /// `min(base * 2^(attempt-1), max) * (1 + jitter_ratio * jitter)`.
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // 2^31 of any sane base already exceeds every cap
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let capped_ms = (base_ms * 2f64.powi(exp)).min(max_ms);
        let jitter_ms = capped_ms * self.jitter_ratio * jitter.clamp(0.0, 1.0);

        Duration::from_millis((capped_ms + jitter_ms) as u64)
    }

    /// `delay_for_attempt` with random jitter
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_for_attempt(attempt, jitter)
    }

    /// Whether `attempts` failures use up the budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&UplinkConfig::default())
    }
}

/// Suspension point for backoff waits
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Real timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Run a lifecycle call, retrying transient failures with backoff
///
/// Exhaustion becomes `PermanentFailure`; a 404 becomes `NotFound`; any other
/// rejection becomes `PreconditionFailed`. `session_id` is nil for calls made
/// before the server has assigned one.
pub async fn retry_remote<T, F, Fut>(
    policy: &BackoffPolicy,
    scheduler: &dyn Scheduler,
    session_id: Uuid,
    operation: &str,
    mut call: F,
) -> Result<T, TrackerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(%session_id, operation, attempt, "Remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && !policy.is_exhausted(attempt) => {
                let delay = policy.next_delay(attempt);
                tracing::warn!(
                    %session_id,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Remote call failed, will retry after backoff"
                );
                scheduler.sleep(delay).await;
            }
            Err(RemoteError::Rejected(404, _)) => return Err(TrackerError::NotFound(session_id)),
            Err(RemoteError::Rejected(code, body)) => {
                return Err(TrackerError::PreconditionFailed(format!(
                    "{} rejected by server ({}): {}",
                    operation, code, body
                )));
            }
            Err(err) => {
                tracing::error!(%session_id, operation, attempt, error = %err, "Remote call failed permanently");
                return Err(TrackerError::PermanentFailure {
                    session_id,
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }
        }
    }
}
