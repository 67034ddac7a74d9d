//! Walk inspection handlers
//!
//! GET /api/walks, GET /api/walks/:id

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use pawtrail_common::{WalkSession, WalkState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListWalksQuery {
    /// Only walks in this state
    pub state: Option<WalkState>,
}

/// One row of GET /api/walks
#[derive(Debug, Serialize)]
pub struct WalkSummary {
    pub session_id: Uuid,
    pub client_id: Uuid,
    pub walker_id: Option<Uuid>,
    pub state: WalkState,
    pub pet_count: usize,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub route_samples: usize,
}

impl From<&WalkSession> for WalkSummary {
    fn from(session: &WalkSession) -> Self {
        Self {
            session_id: session.session_id,
            client_id: session.client_id,
            walker_id: session.walker_id,
            state: session.state,
            pet_count: session.pet_ids.len(),
            requested_at: session.requested_at,
            started_at: session.started_at,
            ended_at: session.ended_at,
            route_samples: session.route.len(),
        }
    }
}

/// GET /api/walks/:id response
#[derive(Debug, Serialize)]
pub struct WalkDetail {
    #[serde(flatten)]
    pub session: WalkSession,
    pub tracking: TrackingView,
    /// Samples not yet acknowledged by the server
    pub buffered_samples: u64,
}

#[derive(Debug, Serialize)]
pub struct TrackingView {
    pub sampling: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub location_lost: bool,
    pub stale: bool,
    pub uplink_failures: u32,
}

/// GET /api/walks
pub async fn list_walks(
    State(state): State<AppState>,
    Query(query): Query<ListWalksQuery>,
) -> Json<Vec<WalkSummary>> {
    let walks = state
        .tracker
        .registry()
        .snapshots()
        .await
        .iter()
        .filter(|s| query.state.map_or(true, |wanted| s.state == wanted))
        .map(WalkSummary::from)
        .collect();
    Json(walks)
}

/// GET /api/walks/:id
pub async fn get_walk(State(state): State<AppState>, Path(session_id): Path<Uuid>) -> ApiResult<Json<WalkDetail>> {
    let entry = state.tracker.registry().get(session_id).await?;
    let session = entry.snapshot().await;
    let status = entry.tracking().await;
    let buffered_samples = state.tracker.buffer().len(session_id).await?;

    Ok(Json(WalkDetail {
        session,
        tracking: TrackingView {
            sampling: state.tracker.is_tracking(session_id).await,
            last_sample_at: status.last_sample_at,
            location_lost: status.location_lost,
            stale: status.stale_flagged,
            uplink_failures: status.uplink_failures,
        },
        buffered_samples,
    }))
}
