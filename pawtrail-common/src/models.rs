//! Walk-session domain models
//!
//! A walk session progresses through the lifecycle
//! REQUESTED → MATCHED → ACTIVE → COMPLETED, with CANCELLED reachable from any
//! non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::geo::GeoPoint;

/// Walk lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalkState {
    /// Client asked for a walk, no walker yet
    Requested,
    /// Walker assigned, heading to pickup
    Matched,
    /// Walk in progress
    Active,
    /// Walker ended the walk
    Completed,
    /// Cancelled by client, walker or system
    Cancelled,
}

impl WalkState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, WalkState::Completed | WalkState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WalkState::Requested => "requested",
            WalkState::Matched => "matched",
            WalkState::Active => "active",
            WalkState::Completed => "completed",
            WalkState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WalkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WalkState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(WalkState::Requested),
            "matched" => Ok(WalkState::Matched),
            "active" => Ok(WalkState::Active),
            "completed" => Ok(WalkState::Completed),
            "cancelled" => Ok(WalkState::Cancelled),
            other => Err(crate::Error::UnknownWalkState(other.to_string())),
        }
    }
}

/// Who initiated a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Client,
    Walker,
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Client => write!(f, "client"),
            Actor::Walker => write!(f, "walker"),
            Actor::System => write!(f, "system"),
        }
    }
}

/// One timestamped position reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub session_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    /// Capture time, millisecond precision, strictly increasing per session
    pub captured_at: DateTime<Utc>,
    /// Set once the server has acknowledged the sample
    pub uploaded: bool,
}

impl LocationSample {
    pub fn new(
        session_id: Uuid,
        position: GeoPoint,
        accuracy: f64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy,
            captured_at: crate::time::truncate_to_millis(captured_at),
            uploaded: false,
        }
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// One end-to-end walk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkSession {
    /// Server-assigned session identifier
    pub session_id: Uuid,

    pub client_id: Uuid,

    /// Assigned walker, set exactly once when matched
    pub walker_id: Option<Uuid>,

    /// Pets on this walk (never empty)
    pub pet_ids: BTreeSet<Uuid>,

    /// Client's registered pickup address
    pub pickup: GeoPoint,

    pub state: WalkState,

    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Acknowledged samples in capture order
    pub route: Vec<LocationSample>,
}

impl WalkSession {
    pub fn new(
        session_id: Uuid,
        client_id: Uuid,
        pet_ids: BTreeSet<Uuid>,
        pickup: GeoPoint,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            walker_id: None,
            pet_ids,
            pickup,
            state: WalkState::Requested,
            requested_at,
            started_at: None,
            ended_at: None,
            route: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Capture time of the newest route sample
    pub fn last_route_time(&self) -> Option<DateTime<Utc>> {
        self.route.last().map(|s| s.captured_at)
    }

    /// Append an acknowledged sample to the route
    ///
    /// Returns false (and leaves the route untouched) if the sample belongs to
    /// another session or is not strictly newer than the current route tail.
    pub fn append_route(&mut self, mut sample: LocationSample) -> bool {
        if sample.session_id != self.session_id {
            return false;
        }
        if let Some(last) = self.last_route_time() {
            if sample.captured_at <= last {
                return false;
            }
        }
        sample.uploaded = true;
        self.route.push(sample);
        true
    }

    /// Whether any acknowledged route sample lies within `radius_m` of pickup
    pub fn has_sample_near_pickup(&self, radius_m: f64) -> bool {
        self.route
            .iter()
            .any(|s| s.position().distance_m(&self.pickup) <= radius_m)
    }
}
