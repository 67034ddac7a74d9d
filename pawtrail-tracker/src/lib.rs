//! pawtrail-tracker library
//!
//! Walk-session lifecycle and location-tracking core: the state machine and
//! registry for in-flight walks, location sampling, the durable sample buffer,
//! and the uplink that drains it to the remote walk API.

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod buffer;
pub mod error;
pub mod registry;
pub mod remote;
pub mod sampler;
pub mod session;
pub mod tracker;
pub mod uplink;
pub mod watchdog;

pub use error::{ErrorKind, Result, TrackerError};
pub use registry::WalkSessionRegistry;
pub use session::WalkSessionStateMachine;
pub use tracker::WalkTracker;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<WalkTracker>,
}

impl AppState {
    pub fn new(tracker: Arc<WalkTracker>) -> Self {
        Self { tracker }
    }
}

/// Build the status router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .route("/api/walks", get(api::list_walks))
        .route("/api/walks/:id", get(api::get_walk))
        .route("/api/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
