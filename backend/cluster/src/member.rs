//! A cluster member as seen in the peer table and carried in Hello messages.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version. Hello messages from another version are ignored.
pub const CLUSTERING_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MastershipStatus {
    Member,
    Master,
    Negotiating,
    Expired,
}

impl std::fmt::Display for MastershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Member => "MEMBER",
            Self::Master => "MASTER",
            Self::Negotiating => "NEGOTIATING",
            Self::Expired => "EXPIRED",
        })
    }
}

/// Equality and hashing use the instance id only. Ordering is by master
/// priority, then instance id, so the largest member is the rightful master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub instance_id: String,
    pub hostname: String,
    pub clustering_version: u32,
    pub master_priority: i32,
    pub runner_priority: i32,
    pub runner_weight: i32,
    pub app_version: String,
    /// Fingerprint of the loaded device drivers; differing hashes mean a reload is due.
    pub driver_hash: String,
    status: MastershipStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    last_status_change_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen_time: DateTime<Utc>,
    /// Set on the entry describing this process. Never sent.
    #[serde(skip)]
    pub local: bool,
}

impl ClusterMember {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        master_priority: i32,
        runner_priority: i32,
        runner_weight: i32,
        app_version: impl Into<String>,
        driver_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            hostname: hostname.into(),
            clustering_version: CLUSTERING_VERSION,
            master_priority,
            runner_priority,
            runner_weight,
            app_version: app_version.into(),
            driver_hash: driver_hash.into(),
            status: MastershipStatus::Negotiating,
            last_status_change_time: now,
            last_seen_time: now,
            local: false,
        }
    }

    pub fn status(&self) -> MastershipStatus {
        self.status
    }

    pub fn last_status_change_time(&self) -> DateTime<Utc> {
        self.last_status_change_time
    }

    /// Change status; the change time is refreshed only on an actual change.
    pub fn set_status(&mut self, status: MastershipStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.last_status_change_time = now;
        }
    }

    pub fn is_expired(&self) -> bool {
        self.status == MastershipStatus::Expired
    }
}

impl PartialEq for ClusterMember {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}

impl Eq for ClusterMember {}

impl Hash for ClusterMember {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id.hash(state);
    }
}

impl PartialOrd for ClusterMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.master_priority
            .cmp(&other.master_priority)
            .then_with(|| self.instance_id.cmp(&other.instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn member(id: &str, priority: i32) -> ClusterMember {
        ClusterMember::new(id, "host", priority, 100, 100, "1.0.0", "abc", Utc::now())
    }

    #[test]
    fn ordering_uses_priority_then_id() {
        let a = member("aaaa", 100);
        let b = member("bbbb", 200);
        let c = member("cccc", 200);
        assert!(a < b);
        assert!(b < c);
        assert_eq!([&b, &a, &c].into_iter().max(), Some(&c));
    }

    #[test]
    fn equality_is_by_instance_id() {
        let mut a = member("aaaa", 100);
        let other = member("aaaa", 500);
        a.hostname = "elsewhere".into();
        assert_eq!(a, other);
    }

    #[test]
    fn status_change_refreshes_timestamp_only_on_change() {
        let mut m = member("aaaa", 1);
        let t0 = m.last_status_change_time();
        let later = t0 + Duration::seconds(5);
        m.set_status(MastershipStatus::Negotiating, later);
        assert_eq!(m.last_status_change_time(), t0);
        m.set_status(MastershipStatus::Master, later);
        assert_eq!(m.status(), MastershipStatus::Master);
        assert_eq!(m.last_status_change_time(), later);
    }

    #[test]
    fn serializes_camel_case_without_local_flag() {
        let mut m = member("aaaa", 1);
        m.local = true;
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["instanceId"], "aaaa");
        assert_eq!(json["status"], "NEGOTIATING");
        assert!(json.get("local").is_none());
        assert!(json["lastSeenTime"].is_i64());
        let back: ClusterMember = serde_json::from_value(json).unwrap();
        assert!(!back.local);
    }
}
