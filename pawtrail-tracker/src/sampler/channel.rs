//! Provider fed by platform callbacks over an mpsc channel

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawtrail_common::GeoPoint;
use tokio::sync::mpsc;

use super::{LocationProvider, RawFix};
use crate::error::{Result, TrackerError};

enum ProviderMessage {
    Fix(RawFix),
    Failed(String),
}

/// Receiving side, consumed by the sampler
pub struct ChannelProvider {
    rx: mpsc::Receiver<ProviderMessage>,
}

/// Sending side, held by the platform glue
#[derive(Clone)]
pub struct ProviderHandle {
    tx: mpsc::Sender<ProviderMessage>,
}

impl ChannelProvider {
    pub fn new(capacity: usize) -> (ProviderHandle, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ProviderHandle { tx }, Self { rx })
    }
}

impl ProviderHandle {
    /// Deliver a fix; returns false once the sampler has gone away
    pub async fn send_fix(&self, position: GeoPoint, accuracy: f64, timestamp: DateTime<Utc>) -> bool {
        self.tx
            .send(ProviderMessage::Fix(RawFix {
                position,
                accuracy,
                timestamp,
            }))
            .await
            .is_ok()
    }

    /// Report a provider failure (permission revoked, hardware off)
    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.tx.send(ProviderMessage::Failed(message.into())).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl LocationProvider for ChannelProvider {
    async fn next_fix(&mut self) -> Result<RawFix> {
        match self.rx.recv().await {
            Some(ProviderMessage::Fix(fix)) => Ok(fix),
            Some(ProviderMessage::Failed(message)) => Err(TrackerError::LocationUnavailable(message)),
            None => Err(TrackerError::LocationUnavailable(
                "location provider disconnected".to_string(),
            )),
        }
    }
}
