// Outbound messaging transport seam

use crate::errors::DeliveryError;
use async_trait::async_trait;
use tracing::info;

/// Delivers a formatted message to one subscriber
///
/// Implemented by the host chat platform; failures are reported per
/// subscriber and never abort delivery to others.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, subscriber_id: &str, message: &str) -> Result<(), DeliveryError>;
}

/// Log-based transport (default implementation)
///
/// Writes every notification to the log at INFO level; used by the
/// standalone binary when no chat platform is attached.
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    #[tracing::instrument(skip(self, message))]
    async fn send(&self, subscriber_id: &str, message: &str) -> Result<(), DeliveryError> {
        info!(
            subscriber_id = subscriber_id,
            message = message,
            "Notification delivered"
        );
        Ok(())
    }
}
