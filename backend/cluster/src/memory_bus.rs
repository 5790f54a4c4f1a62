//! In-process notification bus over a tokio broadcast channel.
//!
//! Lets several coordinators share one "database" inside a single process, and
//! can inject connect failures and dropped connections.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use netwarden_core::NetwardenError;

use crate::bus::{NotificationBus, NotificationConnection};
use crate::message::MAX_PAYLOAD_BYTES;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryNotificationBus {
    inner: Arc<Inner>,
}

struct Inner {
    sender: broadcast::Sender<(String, String)>,
    failing_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    published: AtomicUsize,
    epoch: AtomicU64,
}

impl Default for MemoryNotificationBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sender,
                failing_connects: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
                published: AtomicUsize::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }
}

impl MemoryNotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Break every open connection; their next call returns an error.
    pub fn disconnect_all(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of payloads accepted for delivery so far.
    pub fn published(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationBus for MemoryNotificationBus {
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NetwardenError::ChannelError("connection refused".into()).into());
        }
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            receiver: None,
            channels: Vec::new(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    receiver: Option<broadcast::Receiver<(String, String)>>,
    channels: Vec<String>,
    epoch: u64,
}

impl MemoryConnection {
    fn check_alive(&self) -> Result<()> {
        if self.inner.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(NetwardenError::ChannelError("connection reset".into()).into());
        }
        Ok(())
    }
}

fn accept(channels: &[String], (channel, payload): (String, String), into: &mut Vec<String>) {
    if channels.contains(&channel) {
        into.push(payload);
    }
}

#[async_trait]
impl NotificationConnection for MemoryConnection {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.check_alive()?;
        if self.receiver.is_none() {
            self.receiver = Some(self.inner.sender.subscribe());
        }
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.check_alive()?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetwardenError::MessageTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            }
            .into());
        }
        // No receivers is not an error; nobody is listening yet.
        let _ = self
            .inner
            .sender
            .send((channel.to_string(), payload.to_string()));
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<String>> {
        self.check_alive()?;
        let Some(receiver) = self.receiver.as_mut() else {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        };

        let mut payloads = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while payloads.is_empty() {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Err(_) => break,
                Ok(Ok(item)) => accept(&self.channels, item, &mut payloads),
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => {
                    return Err(NetwardenError::ChannelError("bus closed".into()).into())
                }
            }
        }
        loop {
            match receiver.try_recv() {
                Ok(item) => accept(&self.channels, item, &mut payloads),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        self.check_alive()?;
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let bus = MemoryNotificationBus::new();
        let mut a = bus.connect().await.unwrap();
        let mut b = bus.connect().await.unwrap();
        a.subscribe("clustering").await.unwrap();
        b.subscribe("clustering").await.unwrap();

        a.publish("clustering", "hello").await.unwrap();
        a.publish("elsewhere", "nope").await.unwrap();

        let got = b.receive(Duration::from_millis(200)).await.unwrap();
        assert_eq!(got, vec!["hello".to_string()]);
        let own = a.receive(Duration::from_millis(200)).await.unwrap();
        assert_eq!(own, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let bus = MemoryNotificationBus::new();
        bus.fail_next_connects(2);
        assert!(bus.connect().await.is_err());
        assert!(bus.connect().await.is_err());
        let mut conn = bus.connect().await.unwrap();
        assert_eq!(bus.connect_attempts(), 3);

        conn.subscribe("clustering").await.unwrap();
        bus.disconnect_all();
        assert!(conn.publish("clustering", "x").await.is_err());
        assert!(conn.receive(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_without_subscription_waits_out_timeout() {
        let bus = MemoryNotificationBus::new();
        let mut conn = bus.connect().await.unwrap();
        let got = conn.receive(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_empty());
    }
}
