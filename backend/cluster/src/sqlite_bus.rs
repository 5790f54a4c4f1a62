//! Notification bus backed by a table in a shared SQLite database.
//!
//! Every instance opens the same database file. Publishing inserts a row;
//! subscribers poll for rows past their cursor.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::debug;

use netwarden_core::NetwardenError;

use crate::bus::{NotificationBus, NotificationConnection};
use crate::message::MAX_PAYLOAD_BYTES;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

pub struct SqliteNotificationBus {
    path: PathBuf,
    retention: Duration,
}

impl SqliteNotificationBus {
    /// Open the bus database, creating the notifications table if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cluster_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cluster_notifications_channel
                ON cluster_notifications(channel, id);",
        )
        .context("failed to create cluster_notifications table")?;
        Ok(Self {
            path,
            retention: DEFAULT_RETENTION,
        })
    }

    /// How long published rows are kept before publishers prune them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open notification database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

#[async_trait]
impl NotificationBus for SqliteNotificationBus {
    async fn connect(&self) -> Result<Box<dyn NotificationConnection>> {
        let conn = open_connection(&self.path).map_err(|e| {
            anyhow::Error::from(NetwardenError::ChannelError(format!("{e:#}")))
        })?;
        Ok(Box::new(SqliteConnection {
            conn,
            channels: Vec::new(),
            cursor: 0,
            retention_ms: self.retention.as_millis() as i64,
        }))
    }
}

struct SqliteConnection {
    conn: Connection,
    channels: Vec<String>,
    cursor: i64,
    retention_ms: i64,
}

impl SqliteConnection {
    fn fetch_pending(&mut self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, channel, payload FROM cluster_notifications WHERE id > ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![self.cursor], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut payloads = Vec::new();
        for (id, channel, payload) in rows {
            self.cursor = self.cursor.max(id);
            if self.channels.contains(&channel) {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }
}

#[async_trait]
impl NotificationConnection for SqliteConnection {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        let high_water: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM cluster_notifications",
            [],
            |row| row.get(0),
        )?;
        self.cursor = self.cursor.max(high_water);
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }
        debug!(channel, cursor = self.cursor, "Subscribed to notification channel");
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetwardenError::MessageTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            }
            .into());
        }
        let now = Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO cluster_notifications (channel, payload, created_at) VALUES (?1, ?2, ?3)",
            params![channel, payload, now],
        )?;
        self.conn.execute(
            "DELETE FROM cluster_notifications WHERE created_at < ?1",
            params![now - self.retention_ms],
        )?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let payloads = self.fetch_pending()?;
            if !payloads.is_empty() {
                return Ok(payloads);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("netwarden-bus-{name}-{}.db", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_new_messages() {
        let path = temp_db("new");
        let bus = SqliteNotificationBus::open(&path).unwrap();

        let mut publisher = bus.connect().await.unwrap();
        publisher.publish("clustering", "before").await.unwrap();

        let mut subscriber = bus.connect().await.unwrap();
        subscriber.subscribe("clustering").await.unwrap();
        publisher.publish("clustering", "after").await.unwrap();
        publisher.publish("other", "ignored").await.unwrap();

        let received = subscriber.receive(Duration::from_millis(500)).await.unwrap();
        assert_eq!(received, vec!["after".to_string()]);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let path = temp_db("timeout");
        let bus = SqliteNotificationBus::open(&path).unwrap();
        let mut conn = bus.connect().await.unwrap();
        conn.subscribe("clustering").await.unwrap();

        let started = std::time::Instant::now();
        let received = conn.receive(Duration::from_millis(150)).await.unwrap();
        assert!(received.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(150));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused() {
        let path = temp_db("large");
        let bus = SqliteNotificationBus::open(&path).unwrap();
        let mut conn = bus.connect().await.unwrap();
        conn.subscribe("clustering").await.unwrap();

        let payload = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        let err = conn.publish("clustering", &payload).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetwardenError>(),
            Some(NetwardenError::MessageTooLarge { .. })
        ));
        assert!(conn.receive(Duration::from_millis(50)).await.unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_old_rows_are_pruned() {
        let path = temp_db("prune");
        let bus = SqliteNotificationBus::open(&path)
            .unwrap()
            .with_retention(Duration::ZERO);
        let mut conn = bus.connect().await.unwrap();
        conn.publish("clustering", "one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.publish("clustering", "two").await.unwrap();

        let check = Connection::open(&path).unwrap();
        let count: i64 = check
            .query_row("SELECT COUNT(*) FROM cluster_notifications", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let _ = std::fs::remove_file(&path);
    }
}
