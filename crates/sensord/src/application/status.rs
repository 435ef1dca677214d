//! The status publishing seam.
//!
//! The orchestrator periodically publishes the buffer status of every ready
//! sensor.  It only knows the [`StatusPublisher`] trait; the infrastructure
//! layer decides where the notifications go.

use async_trait::async_trait;
use sensor_core::BufferStatus;
use serde::Serialize;
use thiserror::Error;

/// Name of a status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusEvent {
    /// Periodic snapshot of every ready sensor.
    #[serde(rename = "UPDATE")]
    Update,
}

impl StatusEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusEvent::Update => "UPDATE",
        }
    }
}

/// Errors from publishing a status notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("status channel is closed")]
    Closed,

    #[error("failed to serialize status: {0}")]
    Serialize(String),

    #[error("status transport error: {0}")]
    Transport(String),
}

/// Delivers status notifications to interested processes.
///
/// Having no listeners is not an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, event: StatusEvent, params: Vec<BufferStatus>) -> Result<(), PublishError>;
}
