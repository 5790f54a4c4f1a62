//! Cluster control messages and their JSON wire form.
//!
//! On the wire a message is one flat JSON object: the envelope fields plus a
//! `type` discriminator and the variant's own fields.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use netwarden_core::NetwardenError;

use crate::member::ClusterMember;

/// Largest payload the notification channel accepts.
pub const MAX_PAYLOAD_BYTES: usize = 7999;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMessage {
    pub instance_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub current_time: DateTime<Utc>,
    /// Sender process uptime, in milliseconds.
    pub up_time: u64,
    pub message_id: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum MessageBody {
    Hello { member: ClusterMember },
    LoadTasks,
    ReloadDrivers,
    AutoSnapshot { device_ids: BTreeSet<i64> },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::LoadTasks => "LoadTasks",
            Self::ReloadDrivers => "ReloadDrivers",
            Self::AutoSnapshot { .. } => "AutoSnapshot",
        }
    }
}

impl ClusterMessage {
    pub fn new(
        instance_id: impl Into<String>,
        message_id: u64,
        up_time: u64,
        body: MessageBody,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            current_time: Utc::now(),
            up_time,
            message_id,
            body,
        }
    }

    /// Serialize, refusing anything the channel would not carry whole.
    pub fn encode(&self) -> Result<String, NetwardenError> {
        let payload = serde_json::to_string(self).map_err(anyhow::Error::from)?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetwardenError::MessageTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(payload)
    }

    pub fn decode(payload: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Per-process message id counter. Starts at 1 and outlives channel connections.
#[derive(Debug)]
pub struct MessageSequence {
    next: AtomicU64,
}

impl Default for MessageSequence {
    fn default() -> Self {
        Self { next: AtomicU64::new(1) }
    }
}

impl MessageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
