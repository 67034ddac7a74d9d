//! Walk event stream

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

use crate::AppState;

/// GET /api/events
///
/// Streams every `WalkEvent` as it is published. Delivery is at-least-once;
/// clients de-duplicate state changes by `(session_id, new_state)`.
pub async fn event_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE client connected to walk events");
    pawtrail_common::sse::walk_event_sse_stream(state.tracker.events(), "pawtrail-tracker")
}
