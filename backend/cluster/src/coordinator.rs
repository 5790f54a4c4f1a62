//! The long-running cluster activity: keeps a connection to the notification
//! channel, sends Hellos, applies inbound messages to the view and forwards
//! the resulting events to the host.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use netwarden_core::{NetwardenError, Shutdown};

use crate::backoff::ReconnectBackoff;
use crate::bus::{NotificationBus, NotificationConnection};
use crate::member::{ClusterMember, MastershipStatus};
use crate::message::{ClusterMessage, MessageBody, MessageSequence};
use crate::settings::ClusterSettings;
use crate::view::{ClusterEvent, ClusterView};

const EVENT_BUFFER: usize = 256;

/// State shared between the coordinator loop and its handles.
struct Shared {
    view: Mutex<ClusterView>,
    sequence: MessageSequence,
    reload_drivers: AtomicBool,
    load_tasks: AtomicBool,
    pending_snapshots: Mutex<BTreeSet<i64>>,
    backoff_factor: AtomicU32,
    wake: Notify,
}

impl Shared {
    fn view(&self) -> MutexGuard<'_, ClusterView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_snapshots(&self) -> MutexGuard<'_, BTreeSet<i64>> {
        self.pending_snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ClusterCoordinator {
    settings: ClusterSettings,
    bus: Arc<dyn NotificationBus>,
    shared: Arc<Shared>,
    events: mpsc::Sender<ClusterEvent>,
    started: Instant,
}

impl ClusterCoordinator {
    /// Build a coordinator and the receiving end of its event stream.
    pub fn new(
        settings: ClusterSettings,
        bus: Arc<dyn NotificationBus>,
    ) -> (Self, mpsc::Receiver<ClusterEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let view = ClusterView::new(&settings, Utc::now());
        let shared = Arc::new(Shared {
            view: Mutex::new(view),
            sequence: MessageSequence::new(),
            reload_drivers: AtomicBool::new(false),
            load_tasks: AtomicBool::new(false),
            pending_snapshots: Mutex::new(BTreeSet::new()),
            backoff_factor: AtomicU32::new(0),
            wake: Notify::new(),
        });
        let coordinator = Self {
            settings,
            bus,
            shared,
            events,
            started: Instant::now(),
        };
        (coordinator, receiver)
    }

    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    fn message(&self, body: MessageBody) -> ClusterMessage {
        ClusterMessage::new(
            self.settings.instance_id.clone(),
            self.shared.sequence.next_id(),
            self.started.elapsed().as_millis() as u64,
            body,
        )
    }

    fn emit(&self, event: ClusterEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Cluster event dropped, receiver is not keeping up");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Cluster event receiver closed");
            }
        }
    }

    /// Publish one message. An oversized message is logged and skipped; only
    /// connection failures are returned.
    async fn publish(&self, conn: &mut dyn NotificationConnection, body: MessageBody) -> Result<()> {
        let message = self.message(body);
        let kind = message.body.kind();
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err @ NetwardenError::MessageTooLarge { .. }) => {
                error!(kind, message_id = message.message_id, error = %err, "Cluster message not sent");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match conn.publish(&self.settings.channel, &payload).await {
            Ok(()) => {
                debug!(kind, message_id = message.message_id, "Published cluster message");
                Ok(())
            }
            Err(err)
                if matches!(
                    err.downcast_ref::<NetwardenError>(),
                    Some(NetwardenError::MessageTooLarge { .. })
                ) =>
            {
                error!(kind, message_id = message.message_id, error = %err, "Cluster message not sent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn send_hello_if_due(
        &self,
        conn: &mut dyn NotificationConnection,
        last_hello: &mut Option<Instant>,
    ) -> Result<()> {
        let interval = if self.shared.view().local_status() == MastershipStatus::Negotiating {
            self.settings.negotiating_hello_interval
        } else {
            self.settings.hello_interval
        };
        if last_hello.is_some_and(|sent| sent.elapsed() < interval) {
            return Ok(());
        }
        let member = self.shared.view().hello_snapshot(Utc::now());
        self.publish(conn, MessageBody::Hello { member }).await?;
        *last_hello = Some(Instant::now());
        Ok(())
    }

    async fn flush_requests(&self, conn: &mut dyn NotificationConnection) -> Result<()> {
        let is_master = self.shared.view().local_status() == MastershipStatus::Master;

        if self.shared.reload_drivers.swap(false, Ordering::SeqCst) {
            if is_master {
                self.publish(conn, MessageBody::ReloadDrivers).await?;
                self.emit(ClusterEvent::ReloadDrivers);
            } else {
                debug!("Driver reload request dropped, not master");
            }
        }

        if self.shared.load_tasks.swap(false, Ordering::SeqCst) {
            if is_master {
                self.publish(conn, MessageBody::LoadTasks).await?;
                self.emit(ClusterEvent::LoadTasks);
            } else {
                debug!("Task load request dropped, not master");
            }
        }

        let pending = std::mem::take(&mut *self.shared.pending_snapshots());
        if !pending.is_empty() {
            if is_master {
                let fresh = self.shared.view().dedup_auto_snapshot(&pending, Utc::now());
                if !fresh.is_empty() {
                    self.emit(ClusterEvent::AutoSnapshot(fresh));
                }
            } else {
                self.publish(conn, MessageBody::AutoSnapshot { device_ids: pending })
                    .await?;
            }
        }
        Ok(())
    }

    fn process(&self, payloads: Vec<String>) {
        let now = Utc::now();
        let events = {
            let mut view = self.shared.view();
            let mut events = Vec::new();
            for payload in &payloads {
                match ClusterMessage::decode(payload) {
                    Ok(message) => events.extend(view.observe(&message, now)),
                    Err(err) => warn!(error = %err, "Dropping malformed cluster message"),
                }
            }
            events.extend(view.evaluate(now));
            events
        };
        for event in events {
            self.emit(event);
        }
    }

    /// One connected session. Returns `Ok` on shutdown and `Err` when the
    /// connection breaks.
    async fn run_session(
        &self,
        shutdown: &mut Shutdown,
        backoff: &mut ReconnectBackoff,
        last_hello: &mut Option<Instant>,
    ) -> Result<()> {
        let mut conn = self
            .bus
            .connect()
            .await
            .context("failed to connect to notification channel")?;
        conn.subscribe(&self.settings.channel)
            .await
            .with_context(|| format!("failed to subscribe to {}", self.settings.channel))?;
        backoff.on_success();
        self.shared.backoff_factor.store(0, Ordering::SeqCst);
        info!(
            instance_id = %self.settings.instance_id,
            channel = %self.settings.channel,
            "Connected to cluster notification channel"
        );

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            self.send_hello_if_due(conn.as_mut(), last_hello).await?;
            self.flush_requests(conn.as_mut()).await?;

            let payloads = tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                _ = self.shared.wake.notified() => Vec::new(),
                received = conn.receive(self.settings.receive_timeout) => received?,
            };
            self.process(payloads);
        }
    }
}

impl ClusterCoordinator {
    /// Run until `shutdown` fires, reconnecting with backoff whenever the
    /// notification channel fails.
    pub async fn start(&self, mut shutdown: Shutdown) -> Result<()> {
        let mut backoff = ReconnectBackoff::new(
            self.settings.reconnect_base_delay,
            self.settings.reconnect_max_factor,
        );
        let mut last_hello = None;
        info!(instance_id = %self.settings.instance_id, "Cluster coordinator started");

        loop {
            let delay = backoff.delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if shutdown.is_triggered() {
                break;
            }
            match self
                .run_session(&mut shutdown, &mut backoff, &mut last_hello)
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    backoff.on_failure();
                    self.shared
                        .backoff_factor
                        .store(backoff.factor(), Ordering::SeqCst);
                    warn!(
                        error = %format!("{err:#}"),
                        backoff_factor = backoff.factor(),
                        "Cluster channel failure, reconnecting"
                    );
                }
            }
        }

        info!(instance_id = %self.settings.instance_id, "Cluster coordinator stopped");
        Ok(())
    }
}

/// Cheap handle for inspecting the cluster and queueing control requests.
#[derive(Clone)]
pub struct ClusterHandle {
    shared: Arc<Shared>,
}

impl ClusterHandle {
    /// All known members, local first.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.shared.view().members()
    }

    /// Live members eligible to run jobs.
    pub fn runners(&self) -> Vec<ClusterMember> {
        self.shared.view().runners()
    }

    pub fn local_status(&self) -> MastershipStatus {
        self.shared.view().local_status()
    }

    pub fn is_master(&self) -> bool {
        self.local_status() == MastershipStatus::Master
    }

    /// Instance id of the member currently holding mastership.
    pub fn master(&self) -> Option<String> {
        self.shared
            .view()
            .current_master()
            .map(|m| m.instance_id.clone())
    }

    /// Current reconnect backoff factor; 0 while connected.
    pub fn backoff_factor(&self) -> u32 {
        self.shared.backoff_factor.load(Ordering::SeqCst)
    }

    /// Ask every member to reload device drivers. Only honoured on the master.
    pub fn request_driver_reload(&self) {
        self.shared.reload_drivers.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Ask every member to load its waiting jobs. Only honoured on the master.
    pub fn request_tasks_load(&self) {
        self.shared.load_tasks.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Queue devices for an automatic snapshot; the master deduplicates them.
    pub fn request_auto_snapshot(&self, device_ids: impl IntoIterator<Item = i64>) {
        self.shared.pending_snapshots().extend(device_ids);
        self.shared.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_bus::MemoryNotificationBus;
    use netwarden_config::ClusterConfig;
    use std::time::Duration;

    fn fast_settings(id: &str) -> ClusterSettings {
        let mut settings =
            ClusterSettings::from_config(&ClusterConfig::default()).with_instance_id(id);
        settings.hostname = format!("host-{id}");
        settings.hello_interval = Duration::from_millis(50);
        settings.negotiating_hello_interval = Duration::from_millis(20);
        settings.negotiation = Duration::from_millis(100);
        settings.hold_time = Duration::from_millis(500);
        settings.receive_timeout = Duration::from_millis(20);
        settings.reconnect_base_delay = Duration::from_millis(1);
        settings
    }

    #[tokio::test]
    async fn test_single_member_becomes_master() {
        let bus = Arc::new(MemoryNotificationBus::new());
        let (coordinator, mut events) =
            ClusterCoordinator::new(fast_settings("aaaaaaaaaaaaaaaaaaaa"), bus.clone());
        let handle = coordinator.handle();
        let (trigger, shutdown) = netwarden_core::shutdown::channel();
        let task = tokio::spawn(async move { coordinator.start(shutdown).await });

        let became_master = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ClusterEvent::MastershipChanged { status: MastershipStatus::Master, master } = event {
                    return master;
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(became_master.as_deref(), Some("aaaaaaaaaaaaaaaaaaaa"));
        assert!(handle.is_master());
        assert!(bus.published() >= 1);

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_master_handles_requests_locally() {
        let bus = Arc::new(MemoryNotificationBus::new());
        let mut settings = fast_settings("aaaaaaaaaaaaaaaaaaaa");
        settings.negotiation = Duration::ZERO;
        let (coordinator, mut events) = ClusterCoordinator::new(settings, bus.clone());
        let handle = coordinator.handle();
        let (trigger, shutdown) = netwarden_core::shutdown::channel();
        let task = tokio::spawn(async move { coordinator.start(shutdown).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_master() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.request_tasks_load();
        handle.request_auto_snapshot([7, 8]);
        handle.request_auto_snapshot([8]);

        let mut saw_load = false;
        let mut snapshots = BTreeSet::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(saw_load && snapshots.len() == 2) {
                match events.recv().await {
                    Some(ClusterEvent::LoadTasks) => saw_load = true,
                    Some(ClusterEvent::AutoSnapshot(ids)) => {
                        for id in ids {
                            assert!(snapshots.insert(id), "device {id} snapshotted twice");
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_load);
        assert_eq!(snapshots, [7, 8].into_iter().collect::<BTreeSet<i64>>());

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let bus = Arc::new(MemoryNotificationBus::new());
        bus.fail_next_connects(usize::MAX);
        let mut settings = fast_settings("aaaaaaaaaaaaaaaaaaaa");
        settings.reconnect_base_delay = Duration::from_secs(60);
        let (coordinator, _events) = ClusterCoordinator::new(settings, bus.clone());
        let handle = coordinator.handle();
        let (trigger, shutdown) = netwarden_core::shutdown::channel();
        let task = tokio::spawn(async move { coordinator.start(shutdown).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.backoff_factor() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.backoff_factor(), 1);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
