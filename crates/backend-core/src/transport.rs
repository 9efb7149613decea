use async_trait::async_trait;
use serde_json::Value;

use crate::{error::BackendError, types::SendResponse};

/// Protocol call that puts one event into a room.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `content` as an event of type `event_type`.
    ///
    /// Errors carry a category from [`crate::classify_http_status`] so the
    /// retry loop and its callers can tell transient failures apart.
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<SendResponse, BackendError>;
}
