//! Peer table and mastership election.
//!
//! `ClusterView` holds no clock and does no I/O: every call takes `now`, so the
//! coordinator drives it from the network loop and tests drive it directly.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::member::{ClusterMember, MastershipStatus, CLUSTERING_VERSION};
use crate::message::{ClusterMessage, MessageBody};
use crate::settings::ClusterSettings;

/// Decides when a silent peer stops counting as alive.
pub trait LivenessPolicy: Send + Sync {
    fn is_expired(&self, member: &ClusterMember, now: DateTime<Utc>) -> bool;
}

/// A peer is expired once nothing was heard from it for longer than the hold time.
#[derive(Debug, Clone)]
pub struct HoldTimeLiveness {
    hold_time: Duration,
}

impl HoldTimeLiveness {
    pub fn new(hold_time: Duration) -> Self {
        Self { hold_time }
    }
}

impl LivenessPolicy for HoldTimeLiveness {
    fn is_expired(&self, member: &ClusterMember, now: DateTime<Utc>) -> bool {
        (now - member.last_seen_time)
            .to_std()
            .map(|silence| silence > self.hold_time)
            .unwrap_or(false)
    }
}

/// Something the host process should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    LoadTasks,
    ReloadDrivers,
    /// Devices due for an automatic snapshot, already deduplicated.
    AutoSnapshot(BTreeSet<i64>),
    MastershipChanged {
        status: MastershipStatus,
        master: Option<String>,
    },
    /// The set of live members changed; carries the current live members.
    RunnersChanged(Vec<ClusterMember>),
}

pub struct ClusterView {
    local: ClusterMember,
    peers: HashMap<String, ClusterMember>,
    liveness: Box<dyn LivenessPolicy>,
    negotiation: Duration,
    drift_warning: Duration,
    auto_snapshot_window: Duration,
    recent_snapshots: HashMap<i64, DateTime<Utc>>,
    runners_dirty: bool,
    reported: Option<(MastershipStatus, Option<String>)>,
}

impl ClusterView {
    pub fn new(settings: &ClusterSettings, now: DateTime<Utc>) -> Self {
        let mut local = ClusterMember::new(
            settings.instance_id.clone(),
            settings.hostname.clone(),
            settings.master_priority,
            settings.runner_priority,
            settings.runner_weight,
            settings.app_version.clone(),
            settings.driver_hash.clone(),
            now,
        );
        local.local = true;
        Self {
            local,
            peers: HashMap::new(),
            liveness: Box::new(HoldTimeLiveness::new(settings.hold_time)),
            negotiation: settings.negotiation,
            drift_warning: settings.drift_warning,
            auto_snapshot_window: settings.auto_snapshot_window,
            recent_snapshots: HashMap::new(),
            runners_dirty: true,
            reported: None,
        }
    }

    pub fn with_liveness(mut self, liveness: Box<dyn LivenessPolicy>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn local(&self) -> &ClusterMember {
        &self.local
    }

    pub fn local_status(&self) -> MastershipStatus {
        self.local.status()
    }

    /// Snapshot of the local member to send in a Hello.
    pub fn hello_snapshot(&mut self, now: DateTime<Utc>) -> ClusterMember {
        self.local.last_seen_time = now;
        self.local.clone()
    }

    /// Apply one inbound message to the peer table.
    pub fn observe(&mut self, message: &ClusterMessage, now: DateTime<Utc>) -> Vec<ClusterEvent> {
        if message.instance_id == self.local.instance_id {
            if let MessageBody::Hello { member } = &message.body {
                if member.hostname != self.local.hostname {
                    error!(
                        instance_id = %message.instance_id,
                        hostname = %member.hostname,
                        "Another host is using our cluster instance id"
                    );
                }
            }
            return Vec::new();
        }

        let drift = (message.current_time - now).abs().to_std().unwrap_or_default();
        if drift > self.drift_warning {
            warn!(
                instance_id = %message.instance_id,
                drift_ms = drift.as_millis() as u64,
                "Clock drift with cluster member"
            );
        }

        let mut events = Vec::new();
        match &message.body {
            MessageBody::Hello { member } => self.observe_hello(message, member, now),
            body => {
                if let Some(peer) = self.peers.get_mut(&message.instance_id) {
                    peer.last_seen_time = now;
                }
                match body {
                    MessageBody::LoadTasks => events.push(ClusterEvent::LoadTasks),
                    MessageBody::ReloadDrivers => events.push(ClusterEvent::ReloadDrivers),
                    MessageBody::AutoSnapshot { device_ids } => {
                        if self.local.status() == MastershipStatus::Master {
                            let fresh = self.dedup_auto_snapshot(device_ids, now);
                            if !fresh.is_empty() {
                                events.push(ClusterEvent::AutoSnapshot(fresh));
                            }
                        }
                    }
                    MessageBody::Hello { .. } => {}
                }
            }
        }
        events
    }

    fn observe_hello(&mut self, message: &ClusterMessage, member: &ClusterMember, now: DateTime<Utc>) {
        if member.clustering_version != CLUSTERING_VERSION {
            warn!(
                instance_id = %message.instance_id,
                version = member.clustering_version,
                expected = CLUSTERING_VERSION,
                "Ignoring Hello from incompatible clustering version"
            );
            return;
        }
        if member.instance_id != message.instance_id {
            warn!(
                instance_id = %message.instance_id,
                member_id = %member.instance_id,
                "Ignoring Hello whose member id does not match its sender"
            );
            return;
        }

        let changed = match self.peers.get(&member.instance_id) {
            None => {
                info!(
                    instance_id = %member.instance_id,
                    hostname = %member.hostname,
                    "New cluster member"
                );
                true
            }
            Some(previous) => {
                if previous.is_expired() {
                    info!(instance_id = %member.instance_id, "Cluster member is back");
                }
                previous.is_expired()
                    || previous.runner_priority != member.runner_priority
                    || previous.runner_weight != member.runner_weight
            }
        };
        if changed {
            self.runners_dirty = true;
        }

        let mut peer = member.clone();
        peer.local = false;
        peer.last_seen_time = now;
        self.peers.insert(peer.instance_id.clone(), peer);
    }

    /// Expire silent peers, run the election and move the local status along.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<ClusterEvent> {
        for peer in self.peers.values_mut() {
            if !peer.is_expired() && self.liveness.is_expired(peer, now) {
                warn!(instance_id = %peer.instance_id, "Cluster member expired");
                peer.set_status(MastershipStatus::Expired, now);
                self.runners_dirty = true;
            }
        }

        let local_is_top = self
            .elect_master()
            .map(|top| top.instance_id == self.local.instance_id)
            .unwrap_or(false);
        let previous = self.local.status();
        let next = if local_is_top {
            match previous {
                MastershipStatus::Master => MastershipStatus::Master,
                MastershipStatus::Negotiating => {
                    let settled = (now - self.local.last_status_change_time())
                        .to_std()
                        .map(|elapsed| elapsed >= self.negotiation)
                        .unwrap_or(false);
                    if settled {
                        MastershipStatus::Master
                    } else {
                        MastershipStatus::Negotiating
                    }
                }
                MastershipStatus::Member | MastershipStatus::Expired => {
                    if self.negotiation.is_zero() {
                        MastershipStatus::Master
                    } else {
                        MastershipStatus::Negotiating
                    }
                }
            }
        } else {
            MastershipStatus::Member
        };
        if next != previous {
            info!(
                instance_id = %self.local.instance_id,
                from = %previous,
                to = %next,
                "Local mastership status changed"
            );
            self.local.set_status(next, now);
        }

        let mut events = Vec::new();
        let state = (self.local.status(), self.current_master().map(|m| m.instance_id.clone()));
        if self.reported.as_ref() != Some(&state) {
            debug!(status = %state.0, master = ?state.1, "Mastership state");
            events.push(ClusterEvent::MastershipChanged {
                status: state.0,
                master: state.1.clone(),
            });
            self.reported = Some(state);
        }
        if self.runners_dirty {
            self.runners_dirty = false;
            events.push(ClusterEvent::RunnersChanged(self.runners()));
        }
        events
    }

    /// The live member that should be master: the largest under
    /// `(master_priority, instance_id)`.
    pub fn elect_master(&self) -> Option<&ClusterMember> {
        std::iter::once(&self.local)
            .chain(self.peers.values().filter(|p| !p.is_expired()))
            .max()
    }

    /// The elected member, if it has actually taken mastership.
    pub fn current_master(&self) -> Option<&ClusterMember> {
        self.elect_master()
            .filter(|m| m.status() == MastershipStatus::Master)
    }

    /// Every known member including expired ones, local first.
    pub fn members(&self) -> Vec<ClusterMember> {
        let mut peers: Vec<ClusterMember> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        std::iter::once(self.local.clone()).chain(peers).collect()
    }

    /// Live members, sorted by instance id.
    pub fn runners(&self) -> Vec<ClusterMember> {
        let mut live: Vec<ClusterMember> = std::iter::once(&self.local)
            .chain(self.peers.values().filter(|p| !p.is_expired()))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        live
    }

    /// Keep only device ids not already snapshotted within the window.
    pub fn dedup_auto_snapshot(&mut self, device_ids: &BTreeSet<i64>, now: DateTime<Utc>) -> BTreeSet<i64> {
        let window = self.auto_snapshot_window;
        self.recent_snapshots.retain(|_, seen| {
            (now - *seen)
                .to_std()
                .map(|age| age < window)
                .unwrap_or(true)
        });
        let mut fresh = BTreeSet::new();
        for &id in device_ids {
            if !self.recent_snapshots.contains_key(&id) {
                self.recent_snapshots.insert(id, now);
                fresh.insert(id);
            }
        }
        fresh
    }
}
