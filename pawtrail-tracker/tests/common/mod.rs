//! Shared fixtures for pawtrail-tracker integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawtrail_common::config::TomlConfig;
use pawtrail_common::events::EventBus;
use pawtrail_common::GeoPoint;
use pawtrail_tracker::remote::{CancelRequest, CreateWalkRequest, RemoteError, RemoteWalk, SamplePayload, WalkApi};
use pawtrail_tracker::session::{LifecycleSettings, WalkSessionStateMachine};
use pawtrail_tracker::uplink::{BackoffPolicy, Scheduler};
use pawtrail_tracker::WalkSessionRegistry;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Pickup address used by every test walk (Berlin, Tiergarten)
pub const PICKUP: GeoPoint = GeoPoint {
    latitude: 52.5145,
    longitude: 13.3501,
};

pub const PICKUP_RADIUS_M: f64 = 50.0;

/// Test configuration; `extra` goes first so it may hold top-level keys or tables
pub fn config_toml(extra: &str) -> TomlConfig {
    let text = format!(
        r#"
{}

[api]
base_url = "http://127.0.0.1:9"

[tracking]
pickup_radius_m = {:.1}
sample_timeout_secs = 60
foreground_interval_ms = 1
background_interval_ms = 1

[uplink]
base_delay_ms = 100
max_delay_ms = 1000
max_attempts = 5
poll_interval_ms = 20
"#,
        extra, PICKUP_RADIUS_M
    );
    TomlConfig::from_toml_str(&text).expect("test config should parse")
}

/// Scheduler that records requested delays and never waits
#[derive(Default)]
pub struct RecordingScheduler {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    uploads: Vec<(Uuid, Vec<SamplePayload>)>,
    upload_failures: VecDeque<RemoteError>,
    always_fail_uploads: Option<RemoteError>,
    lifecycle_failures: VecDeque<RemoteError>,
    in_flight: Vec<RemoteWalk>,
}

/// In-memory stand-in for the remote walk API
#[derive(Default)]
pub struct FakeWalkApi {
    state: Mutex<FakeState>,
}

impl FakeWalkApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` uploads with a 503
    pub fn fail_next_uploads(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            state.upload_failures.push_back(RemoteError::Unavailable(503, "maintenance".into()));
        }
    }

    pub fn fail_all_uploads(&self, err: RemoteError) {
        self.state.lock().unwrap().always_fail_uploads = Some(err);
    }

    pub fn heal_uploads(&self) {
        let mut state = self.state.lock().unwrap();
        state.always_fail_uploads = None;
        state.upload_failures.clear();
    }

    /// Fail the next `n` lifecycle calls (create/match/start/end/cancel/list)
    pub fn fail_next_lifecycle(&self, errors: Vec<RemoteError>) {
        self.state.lock().unwrap().lifecycle_failures.extend(errors);
    }

    pub fn set_in_flight(&self, walks: Vec<RemoteWalk>) {
        self.state.lock().unwrap().in_flight = walks;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Every sample the server accepted for a session, in arrival order
    pub fn uploaded(&self, session_id: Uuid) -> Vec<SamplePayload> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .iter()
            .filter(|(id, _)| *id == session_id)
            .flat_map(|(_, batch)| batch.clone())
            .collect()
    }

    fn lifecycle(&self, call: String) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.lifecycle_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WalkApi for FakeWalkApi {
    async fn create_walk(&self, _request: &CreateWalkRequest) -> Result<Uuid, RemoteError> {
        self.lifecycle("create".to_string())?;
        Ok(Uuid::new_v4())
    }

    async fn match_walker(&self, session_id: Uuid, _walker_id: Uuid) -> Result<(), RemoteError> {
        self.lifecycle(format!("match:{}", session_id))
    }

    async fn upload_locations(
        &self,
        session_id: Uuid,
        samples: &[SamplePayload],
    ) -> Result<Option<DateTime<Utc>>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("upload:{}", session_id));
        if let Some(err) = state.always_fail_uploads.clone() {
            return Err(err);
        }
        if let Some(err) = state.upload_failures.pop_front() {
            return Err(err);
        }
        state.uploads.push((session_id, samples.to_vec()));
        Ok(samples.iter().map(|s| s.captured_at).max())
    }

    async fn start_walk(&self, session_id: Uuid) -> Result<(), RemoteError> {
        self.lifecycle(format!("start:{}", session_id))
    }

    async fn end_walk(&self, session_id: Uuid) -> Result<(), RemoteError> {
        self.lifecycle(format!("end:{}", session_id))
    }

    async fn cancel_walk(&self, session_id: Uuid, request: &CancelRequest) -> Result<(), RemoteError> {
        self.lifecycle(format!("cancel:{}:{}:{}", session_id, request.actor, request.reason))
    }

    async fn list_in_flight(&self, _account_id: Uuid) -> Result<Vec<RemoteWalk>, RemoteError> {
        self.lifecycle("list".to_string())?;
        Ok(self.state.lock().unwrap().in_flight.clone())
    }
}

pub struct MachineFixture {
    pub machine: Arc<WalkSessionStateMachine>,
    pub api: Arc<FakeWalkApi>,
    pub scheduler: Arc<RecordingScheduler>,
    pub events: EventBus,
}

pub fn machine_fixture(auto_start_on_pickup: bool) -> MachineFixture {
    let api = FakeWalkApi::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let events = EventBus::new(64);
    let machine = WalkSessionStateMachine::new(
        Arc::new(WalkSessionRegistry::new()),
        api.clone(),
        events.clone(),
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 5,
            jitter_ratio: 0.0,
        },
        scheduler.clone(),
        LifecycleSettings {
            pickup_radius_m: PICKUP_RADIUS_M,
            auto_start_on_pickup,
        },
    );

    MachineFixture {
        machine: Arc::new(machine),
        api,
        scheduler,
        events,
    }
}

pub fn pets(n: usize) -> BTreeSet<Uuid> {
    (0..n).map(|_| Uuid::new_v4()).collect()
}

/// A point roughly `meters` north of the pickup address
pub fn north_of_pickup(meters: f64) -> GeoPoint {
    GeoPoint::new(PICKUP.latitude + meters / 111_195.0, PICKUP.longitude)
}

pub fn at_millis(millis: i64) -> DateTime<Utc> {
    pawtrail_common::time::from_millis(millis)
}
