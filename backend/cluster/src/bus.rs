//! Publish/subscribe seam between the coordinator and whatever carries its messages.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Something that can open connections to a shared broadcast channel.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>>;
}

/// One live connection. Any error returned here is treated as a broken
/// connection by the caller, except `NetwardenError::MessageTooLarge` on publish.
#[async_trait]
pub trait NotificationConnection: Send {
    /// Start receiving payloads published on `channel` from now on.
    async fn subscribe(&mut self, channel: &str) -> Result<()>;

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()>;

    /// Wait at most `timeout` for payloads, returning everything pending.
    /// An empty vector means nothing arrived.
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<String>>;
}
