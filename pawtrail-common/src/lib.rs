//! # PawTrail Common Library
//!
//! Shared code for the PawTrail walk-tracking core:
//! - Domain models (walk sessions, location samples, lifecycle states)
//! - Event types (WalkEvent enum) and the broadcast EventBus
//! - Configuration loading
//! - Database initialization
//! - Geo and time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod geo;
pub mod models;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use geo::GeoPoint;
pub use models::{Actor, LocationSample, WalkSession, WalkState};
