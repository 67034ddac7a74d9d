//! Walk history archive
//!
//! Terminal walks leave the registry after their retention window and are
//! handed to a [`HistoryArchive`]. The backend keeps the authoritative
//! history; [`SqliteHistoryArchive`] is the local copy used on the device.

use async_trait::async_trait;
use pawtrail_common::WalkSession;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{storage_error, Result};

/// Destination for walks leaving the registry
#[async_trait]
pub trait HistoryArchive: Send + Sync {
    async fn archive(&self, session: &WalkSession) -> Result<()>;
}

/// `walk_history` table archive
#[derive(Clone)]
pub struct SqliteHistoryArchive {
    pool: SqlitePool,
}

impl SqliteHistoryArchive {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Archived walk record, if present
    pub async fn fetch(&self, session_id: Uuid) -> Result<Option<WalkSession>> {
        let row: Option<Json<WalkSession>> =
            sqlx::query_scalar("SELECT session_json FROM walk_history WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(row.map(|Json(session)| session))
    }

    /// Archived walks for a client, newest request first
    pub async fn for_client(&self, client_id: Uuid) -> Result<Vec<WalkSession>> {
        let rows: Vec<Json<WalkSession>> = sqlx::query_scalar(
            "SELECT session_json FROM walk_history WHERE client_id = ? ORDER BY requested_at DESC",
        )
        .bind(client_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(|Json(session)| session).collect())
    }
}

#[async_trait]
impl HistoryArchive for SqliteHistoryArchive {
    async fn archive(&self, session: &WalkSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO walk_history (
                session_id, state, client_id, walker_id,
                requested_at, started_at, ended_at, session_json, archived_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                state = excluded.state,
                ended_at = excluded.ended_at,
                session_json = excluded.session_json,
                archived_at = excluded.archived_at
            "#,
        )
        .bind(session.session_id.to_string())
        .bind(session.state.as_str())
        .bind(session.client_id.to_string())
        .bind(session.walker_id.map(|id| id.to_string()))
        .bind(session.requested_at.to_rfc3339())
        .bind(session.started_at.map(|t| t.to_rfc3339()))
        .bind(session.ended_at.map(|t| t.to_rfc3339()))
        .bind(Json(session))
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::debug!(session_id = %session.session_id, state = %session.state, "Walk archived");
        Ok(())
    }
}
