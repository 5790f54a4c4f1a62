//! `netwarden-cluster`: multi-instance coordination over a shared database.
//!
//! Instances broadcast Hello heartbeats on a notification channel, keep a peer
//! table, and agree on a master: the live member with the highest
//! `(master_priority, instance_id)`.

pub mod backoff;
pub mod bus;
pub mod coordinator;
pub mod identity;
pub mod member;
pub mod memory_bus;
pub mod message;
pub mod settings;
pub mod sqlite_bus;
pub mod view;

pub use backoff::ReconnectBackoff;
pub use bus::{NotificationBus, NotificationConnection};
pub use coordinator::{ClusterCoordinator, ClusterHandle};
pub use identity::{derive_instance_id, resolve_instance_id};
pub use member::{ClusterMember, MastershipStatus, CLUSTERING_VERSION};
pub use memory_bus::MemoryNotificationBus;
pub use message::{ClusterMessage, MessageBody, MessageSequence, MAX_PAYLOAD_BYTES};
pub use settings::ClusterSettings;
pub use sqlite_bus::SqliteNotificationBus;
pub use view::{ClusterEvent, ClusterView, HoldTimeLiveness, LivenessPolicy};
