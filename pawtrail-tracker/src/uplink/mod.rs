//! Uplink: draining the sample buffer to the remote API

pub mod backoff;
mod dispatcher;

pub use backoff::{BackoffPolicy, Scheduler, TokioScheduler};
pub use dispatcher::{DispatchOutcome, UplinkDispatcher, UploadTask};
