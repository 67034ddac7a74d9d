//! Remote walk API boundary
//!
//! The marketplace backend owns matching, history and billing. This module
//! defines the typed contract the tracker core consumes ([`WalkApi`]) and the
//! reqwest-backed implementation ([`HttpWalkApi`]).

mod http;

pub use http::HttpWalkApi;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawtrail_common::{Actor, GeoPoint, LocationSample, WalkState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Remote call failure
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection, DNS or timeout failure
    #[error("Network error: {0}")]
    Network(String),

    /// 5xx or 429; the request may succeed later
    #[error("Server error {0}: {1}")]
    Unavailable(u16, String),

    /// Other 4xx; retrying the same request will not help
    #[error("Request rejected {0}: {1}")]
    Rejected(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl RemoteError {
    /// Whether a retry with backoff is worthwhile
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Unavailable(..))
    }
}

/// `POST /walks` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWalkRequest {
    pub client_id: Uuid,
    pub pet_ids: Vec<Uuid>,
    pub pickup: GeoPoint,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWalkResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub walker_id: Uuid,
}

/// One sample on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplePayload {
    pub captured_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl From<&LocationSample> for SamplePayload {
    fn from(sample: &LocationSample) -> Self {
        Self {
            captured_at: sample.captured_at,
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy,
        }
    }
}

/// `POST /walks/{id}/locations` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Highest capture time the server has stored; None if nothing was accepted
    pub acknowledged_up_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub actor: Actor,
    pub reason: String,
}

/// In-flight walk as reported by `GET /walks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWalk {
    pub session_id: Uuid,
    pub client_id: Uuid,
    pub walker_id: Option<Uuid>,
    pub pet_ids: Vec<Uuid>,
    pub pickup: GeoPoint,
    pub state: WalkState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Typed contract of the remote walk API
#[async_trait]
pub trait WalkApi: Send + Sync {
    /// `POST /walks`; returns the new session id
    async fn create_walk(&self, request: &CreateWalkRequest) -> Result<Uuid, RemoteError>;

    /// `POST /walks/{id}/match`
    async fn match_walker(&self, session_id: Uuid, walker_id: Uuid) -> Result<(), RemoteError>;

    /// `POST /walks/{id}/locations`; returns the highest acknowledged capture time
    async fn upload_locations(
        &self,
        session_id: Uuid,
        samples: &[SamplePayload],
    ) -> Result<Option<DateTime<Utc>>, RemoteError>;

    /// `POST /walks/{id}/start`
    async fn start_walk(&self, session_id: Uuid) -> Result<(), RemoteError>;

    /// `POST /walks/{id}/end`
    async fn end_walk(&self, session_id: Uuid) -> Result<(), RemoteError>;

    /// `POST /walks/{id}/cancel`
    async fn cancel_walk(&self, session_id: Uuid, request: &CancelRequest) -> Result<(), RemoteError>;

    /// `GET /walks?account={id}&in_flight=true`
    async fn list_in_flight(&self, account_id: Uuid) -> Result<Vec<RemoteWalk>, RemoteError>;
}
