//! Durable sample buffer
//!
//! One logical FIFO per walk session, stored in the `sample_buffer` table so
//! that unsent samples survive process restarts. Samples are keyed by
//! `(session_id, captured_at)`: enqueueing the same pair twice is a no-op, and
//! rows leave the table only through [`SampleBuffer::acknowledge`] (or an
//! explicit purge when a cancelled walk's history is discarded).

use chrono::{DateTime, Utc};
use pawtrail_common::time::{from_millis, to_millis};
use pawtrail_common::LocationSample;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{storage_error, Result, TrackerError};

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// Same (session, capture time) already buffered
    Duplicate,
}

/// SQLite-backed queue of unacknowledged samples
#[derive(Clone)]
pub struct SampleBuffer {
    pool: SqlitePool,
    max_samples: u64,
}

impl SampleBuffer {
    /// `max_samples` bounds the total rows across all sessions
    pub fn new(pool: SqlitePool, max_samples: u64) -> Self {
        Self { pool, max_samples }
    }

    /// Append a sample to its session's queue
    ///
    /// Fails only with `BufferFull` (capacity or disk exhausted) or a storage error.
    pub async fn enqueue(&self, sample: &LocationSample) -> Result<EnqueueOutcome> {
        let session_id = sample.session_id.to_string();
        let captured_at_ms = to_millis(sample.captured_at);

        // Capacity check and insert in one statement; a duplicate key is a no-op
        let inserted = sqlx::query(
            r#"
            INSERT INTO sample_buffer (session_id, captured_at_ms, latitude, longitude, accuracy)
            SELECT ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM sample_buffer) < ?
            ON CONFLICT (session_id, captured_at_ms) DO NOTHING
            "#,
        )
        .bind(&session_id)
        .bind(captured_at_ms)
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(sample.accuracy)
        .bind(i64::try_from(self.max_samples).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();

        if inserted > 0 {
            return Ok(EnqueueOutcome::Inserted);
        }

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM sample_buffer WHERE session_id = ? AND captured_at_ms = ?",
        )
        .bind(&session_id)
        .bind(captured_at_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        if exists.is_some() {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sample_buffer")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        tracing::error!(
            session_id = %sample.session_id,
            buffered = total,
            max_samples = self.max_samples,
            "Sample buffer full"
        );
        Err(TrackerError::BufferFull(format!(
            "{} samples buffered (limit {})",
            total, self.max_samples
        )))
    }

    /// Oldest unacknowledged samples for a session, in capture order
    ///
    /// Nothing is removed; see [`SampleBuffer::acknowledge`].
    pub async fn dequeue_batch(&self, session_id: Uuid, max_size: usize) -> Result<Vec<LocationSample>> {
        let rows = sqlx::query(
            r#"
            SELECT captured_at_ms, latitude, longitude, accuracy
            FROM sample_buffer
            WHERE session_id = ?
            ORDER BY captured_at_ms ASC
            LIMIT ?
            "#,
        )
        .bind(session_id.to_string())
        .bind(max_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|row| LocationSample {
                session_id,
                latitude: row.get("latitude"),
                longitude: row.get("longitude"),
                accuracy: row.get("accuracy"),
                captured_at: from_millis(row.get("captured_at_ms")),
                uploaded: false,
            })
            .collect())
    }

    /// Remove every sample of the session captured at or before `up_to`
    ///
    /// Returns the number of samples removed.
    pub async fn acknowledge(&self, session_id: Uuid, up_to: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sample_buffer WHERE session_id = ? AND captured_at_ms <= ?")
            .bind(session_id.to_string())
            .bind(to_millis(up_to))
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(result.rows_affected())
    }

    /// Drop all of a session's samples
    pub async fn purge(&self, session_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sample_buffer WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(result.rows_affected())
    }

    /// Buffered samples for one session
    pub async fn len(&self, session_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sample_buffer WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(count as u64)
    }

    pub async fn is_empty(&self, session_id: Uuid) -> Result<bool> {
        Ok(self.len(session_id).await? == 0)
    }

    /// Buffered samples across all sessions
    pub async fn total_len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sample_buffer")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(count as u64)
    }

    /// Newest buffered capture time for a session
    pub async fn newest_captured_at(&self, session_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let newest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(captured_at_ms) FROM sample_buffer WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(newest.map(from_millis))
    }

    /// Sessions that still have unacknowledged samples (restart recovery)
    pub async fn pending_sessions(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT DISTINCT session_id FROM sample_buffer")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(ids
            .into_iter()
            .filter_map(|id| match Uuid::parse_str(&id) {
                Ok(uuid) => Some(uuid),
                Err(e) => {
                    tracing::warn!(session_id = %id, "Skipping buffered rows with invalid session id: {}", e);
                    None
                }
            })
            .collect())
    }
}
