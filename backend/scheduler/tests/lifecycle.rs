//! End-to-end job lifecycle: admission, single execution per job, startup
//! recovery (standalone and clustered) and recurrence.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Notify;

use netwarden_hooks::HookPipeline;
use netwarden_scheduler::{
    HandlerRegistry, Job, JobContext, JobHandler, JobId, JobPayload, JobRunner, JobScheduler,
    JobStatus, JobStore, JobType, ScheduleType, SqliteJobStore,
};

/// Counts concurrent bodies and waits for the test to let it go.
struct RunTracker {
    active: AtomicUsize,
    max_active: AtomicUsize,
    runs: AtomicUsize,
    started: Notify,
    release: Notify,
}

impl RunTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

struct GatedSnapshot(Arc<RunTracker>);

#[async_trait]
impl JobHandler for GatedSnapshot {
    async fn run(&self, job: &mut Job, _ctx: &JobContext) -> anyhow::Result<()> {
        let tracker = &self.0;
        let now_active = tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
        tracker.max_active.fetch_max(now_active, Ordering::SeqCst);
        tracker.runs.fetch_add(1, Ordering::SeqCst);
        tracker.started.notify_one();
        tracker.release.notified().await;
        tracker.active.fetch_sub(1, Ordering::SeqCst);
        job.set_status(JobStatus::Success);
        Ok(())
    }
}

struct Instant;

#[async_trait]
impl JobHandler for Instant {
    async fn run(&self, job: &mut Job, _ctx: &JobContext) -> anyhow::Result<()> {
        job.log.info("done");
        job.set_status(JobStatus::Success);
        Ok(())
    }
}

fn build(handler: Arc<dyn JobHandler>) -> (Arc<dyn JobStore>, JobScheduler, JobRunner) {
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
    let mut handlers = HandlerRegistry::new();
    handlers.register(JobType::TakeSnapshot, handler);
    let handlers = Arc::new(handlers);
    let runner = JobRunner::new(store.clone(), handlers.clone(), HookPipeline::default(), None);
    let scheduler = JobScheduler::new(
        store.clone(),
        JobRunner::new(store.clone(), handlers, HookPipeline::default(), None),
        10,
    );
    (store, scheduler, runner)
}

/// A cluster member's scheduler on a shared job table.
fn member(store: &Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, runner_id: &str) -> JobScheduler {
    let mut handlers = HandlerRegistry::new();
    handlers.register(JobType::TakeSnapshot, handler);
    let runner = JobRunner::new(
        store.clone(),
        Arc::new(handlers),
        HookPipeline::default(),
        Some(runner_id.to_string()),
    );
    JobScheduler::new(store.clone(), runner, 4)
}

fn snapshot(device_id: i64) -> Job {
    Job::new(
        JobPayload::TakeSnapshot {
            device_id,
            automatic: false,
            dont_run_diagnostics: true,
            dont_check_compliance: true,
        },
        "integration",
    )
}

fn load(store: &Arc<dyn JobStore>, id: JobId) -> Job {
    let mut tx = store.begin().unwrap();
    tx.get(id).unwrap().unwrap()
}

fn insert(store: &Arc<dyn JobStore>, mut job: Job) -> JobId {
    let mut tx = store.begin().unwrap();
    let id = tx.save(&mut job).unwrap();
    tx.commit().unwrap();
    id
}

#[tokio::test]
async fn same_job_never_runs_twice_concurrently() {
    let tracker = RunTracker::new();
    let (store, scheduler, _) = build(Arc::new(GatedSnapshot(tracker.clone())));

    let id = scheduler.add(snapshot(1)).unwrap();
    tracker.started.notified().await;
    assert_eq!(load(&store, id).status, JobStatus::Running);

    // re-adding the job while it runs must not start a second body
    for _ in 0..3 {
        let again = load(&store, id);
        assert_eq!(scheduler.add(again).unwrap(), id);
    }
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(tracker.runs.load(Ordering::SeqCst), 1);

    tracker.release.notify_one();
    for _ in 0..200 {
        if load(&store, id).status == JobStatus::Success {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(load(&store, id).status, JobStatus::Success);
    assert_eq!(tracker.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_jobs_run_in_parallel() {
    let tracker = RunTracker::new();
    let (store, scheduler, _) = build(Arc::new(GatedSnapshot(tracker.clone())));

    let a = scheduler.add(snapshot(1)).unwrap();
    let b = scheduler.add(snapshot(2)).unwrap();
    for _ in 0..200 {
        if tracker.runs.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(tracker.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(load(&store, a).status, JobStatus::Running);
    assert_eq!(load(&store, b).status, JobStatus::Running);

    tracker.release.notify_waiters();
}

#[tokio::test]
async fn startup_recovers_jobs_left_running() {
    let (store, scheduler, _) = build(Arc::new(Instant));
    let now = Utc::now();

    // crashed mid-run, recurring: must come back as SCHEDULED
    let mut daily = snapshot(1).with_schedule(ScheduleType::Daily, 1, now - Duration::days(3));
    daily.set_running();
    let daily_id = insert(&store, daily);

    // crashed mid-run, one-shot in the past: too late
    let mut past = snapshot(2).with_schedule(ScheduleType::At, 1, now - Duration::hours(1));
    past.set_running();
    let past_id = insert(&store, past);

    // scheduled one-shot well ahead: re-admitted
    let mut future = snapshot(3).with_schedule(ScheduleType::At, 1, now + Duration::hours(4));
    future.set_status(JobStatus::Scheduled);
    let future_id = insert(&store, future);

    // queued ASAP before the crash: nothing to wait for, cancelled
    let mut asap = snapshot(4);
    asap.set_status(JobStatus::Scheduled);
    let asap_id = insert(&store, asap);

    let report = scheduler.reschedule_all().unwrap();
    assert_eq!(report.readmitted, vec![daily_id, future_id]);
    assert_eq!(report.cancelled, vec![past_id, asap_id]);

    assert_eq!(load(&store, daily_id).status, JobStatus::Scheduled);
    assert_eq!(load(&store, future_id).status, JobStatus::Scheduled);
    let skipped = load(&store, past_id);
    assert_eq!(skipped.status, JobStatus::Cancelled);
    assert!(skipped.log.text().contains("too late to run at server startup"));
    assert_eq!(load(&store, asap_id).status, JobStatus::Cancelled);

    let mut tx = store.begin().unwrap();
    assert!(tx.list_by_status(&[JobStatus::Running]).unwrap().is_empty());
    assert_eq!(scheduler.tracked(), 2);
}

#[tokio::test]
async fn daily_job_produces_exactly_one_successor() {
    let (store, scheduler, runner) = build(Arc::new(Instant));
    let mut daily = snapshot(5)
        .with_schedule(ScheduleType::Daily, 1, Utc::now() - Duration::hours(1))
        .with_priority(9);
    daily.set_status(JobStatus::Scheduled);
    let id = insert(&store, daily);

    let report = runner
        .execute(id, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Success);
    let successor = report.successor.expect("daily job must recur");
    let next_id = scheduler.add(successor).unwrap();
    assert_ne!(next_id, id);

    let mut tx = store.begin().unwrap();
    let scheduled = tx.list_by_status(&[JobStatus::Scheduled]).unwrap();
    assert_eq!(scheduled.len(), 1);
    let next = &scheduled[0];
    assert_eq!(next.id, Some(next_id));
    assert_eq!(next.schedule_type, ScheduleType::Daily);
    assert_eq!(next.schedule_factor, 1);
    assert_eq!(next.priority, 9);
    assert_eq!(tx.get(id).unwrap().unwrap().status, JobStatus::Success);
}

#[tokio::test]
async fn member_startup_leaves_jobs_of_running_members_alone() {
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
    let tracker = RunTracker::new();
    let a = member(&store, Arc::new(GatedSnapshot(tracker.clone())), "member-a");
    let b = member(&store, Arc::new(Instant), "member-b");

    let running_on_a = a.add(snapshot(1)).unwrap();
    tracker.started.notified().await;
    let job = load(&store, running_on_a);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.runner_id.as_deref(), Some("member-a"));

    // b crashed while running this one before it came back
    let mut crashed = snapshot(2);
    crashed.set_running();
    crashed.runner_id = Some("member-b".into());
    let crashed_id = insert(&store, crashed);

    let report = b.reschedule_all().unwrap();
    assert!(report.readmitted.is_empty());
    assert_eq!(report.cancelled, vec![crashed_id]);
    assert_eq!(load(&store, running_on_a).status, JobStatus::Running);
    assert_eq!(load(&store, crashed_id).status, JobStatus::Cancelled);

    tracker.release.notify_one();
    for _ in 0..200 {
        if load(&store, running_on_a).status == JobStatus::Success {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(load(&store, running_on_a).status, JobStatus::Success);
    assert_eq!(tracker.runs.load(Ordering::SeqCst), 1);
}

/// Holds the thread for a second so the wall clock moves past the occurrence it served.
struct SlowDaily(Arc<Notify>);

#[async_trait]
impl JobHandler for SlowDaily {
    async fn run(&self, job: &mut Job, _ctx: &JobContext) -> anyhow::Result<()> {
        std::thread::sleep(StdDuration::from_secs(1));
        job.set_status(JobStatus::Success);
        self.0.notify_one();
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_daily_run_submits_its_own_successor() {
    let done = Arc::new(Notify::new());
    let (store, scheduler, _) = build(Arc::new(SlowDaily(done.clone())));

    // first occurrence lands half a second past the one-minute margin
    let reference =
        Utc::now() - Duration::days(1) + Duration::seconds(60) + Duration::milliseconds(500);
    let id = scheduler
        .add(snapshot(6).with_schedule(ScheduleType::Daily, 1, reference).with_priority(3))
        .unwrap();

    // the paused clock jumps straight to the trigger
    done.notified().await;

    let mut scheduled = Vec::new();
    for _ in 0..200 {
        scheduled = store
            .begin()
            .unwrap()
            .list_by_status(&[JobStatus::Scheduled])
            .unwrap();
        if !scheduled.is_empty() && load(&store, id).status == JobStatus::Success {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    assert_eq!(load(&store, id).status, JobStatus::Success);
    assert_eq!(scheduled.len(), 1);
    let next = &scheduled[0];
    assert_ne!(next.id, Some(id));
    assert_eq!(next.schedule_type, ScheduleType::Daily);
    assert_eq!(next.priority, 3);
    assert_eq!(
        next.schedule_reference.timestamp_millis(),
        reference.timestamp_millis()
    );
    let expected = reference + Duration::days(2);
    assert_eq!(
        next.next_execution(Utc::now()).map(|t| t.timestamp_millis()),
        Some(expected.timestamp_millis())
    );
    assert_eq!(scheduler.tracked(), 1);
}
