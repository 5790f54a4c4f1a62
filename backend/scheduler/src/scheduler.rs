//! The job scheduler.
//!
//! Each admitted job gets one trigger task keyed by the job identity
//! (`<type>_<id>`). While a trigger exists for an identity, adding that job
//! again is a no-op, so one job never has two executions in flight. Trigger
//! tasks sleep until the job's next instant, then take a worker permit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use netwarden_core::NetwardenError;

use crate::clock::SCHEDULE_MARGIN_SECS;
use crate::job::{Job, JobId, JobStatus};
use crate::placement::{RunnerCandidate, RunnerSelector, RunnerSet};
use crate::runner::JobRunner;
use crate::store::JobStore;

const STARTUP_TOO_LATE: &str = "Task skipped, too late to run at server startup";

struct Trigger {
    generation: u64,
    job_id: JobId,
    running: bool,
    abort: Option<AbortHandle>,
    cancel: Arc<AtomicBool>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    permits: Arc<Semaphore>,
    triggers: Mutex<HashMap<String, Trigger>>,
    next_generation: AtomicU64,
}

/// What `reschedule_all` decided for each job found at startup.
#[derive(Debug, Default, Clone)]
pub struct RescheduleReport {
    pub readmitted: Vec<JobId>,
    pub cancelled: Vec<JobId>,
}

/// Cheap to clone; all clones drive the same trigger table.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, runner: JobRunner, thread_count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                permits: Arc::new(Semaphore::new(thread_count.max(1))),
                triggers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Admit a job: `on_schedule`, save as SCHEDULED, arm its trigger.
    ///
    /// A job whose identity already has a pending or running trigger is left alone.
    pub fn add(&self, mut job: Job) -> Result<JobId> {
        if let Some(id) = job.id {
            if self.is_tracked(&job.identity())? {
                warn!(job_id = %id, "Job is already scheduled or running, not adding it again");
                return Ok(id);
            }
        }

        if let Some(handler) = self.inner.runner.handlers().get(job.job_type()) {
            handler.on_schedule(&mut job);
        }
        job.set_status(JobStatus::Scheduled);
        let id = self.save(&mut job)?;

        let when = job.next_execution(Utc::now());
        debug!(job_id = %id, when = ?when, "Job scheduled");
        self.arm(job.identity(), id, when)?;
        Ok(id)
    }

    /// Withdraw a job. A pending trigger is dropped; a running body only sees its
    /// cancel flag set and finishes on its own.
    pub fn cancel(&self, id: JobId, reason: &str) -> Result<()> {
        let mut job = self.load(id)?;
        debug!(job_id = %id, "Cancelling job");

        {
            let mut triggers = self.triggers()?;
            let identity = job.identity();
            let running = triggers.get(&identity).map(|t| t.running);
            match running {
                Some(true) => {
                    if let Some(trigger) = triggers.get(&identity) {
                        trigger.cancel.store(true, Ordering::SeqCst);
                    }
                }
                Some(false) => {
                    if let Some(abort) = triggers.remove(&identity).and_then(|t| t.abort) {
                        abort.abort();
                    }
                }
                None => {}
            }
        }

        if let Some(handler) = self.inner.runner.handlers().get(job.job_type()) {
            handler.on_cancel(&mut job);
        }
        job.set_status(JobStatus::Cancelled);
        job.log.warn(reason);
        self.save(&mut job)?;
        info!(job_id = %id, reason = %reason, "Job cancelled");
        Ok(())
    }

    /// Startup recovery: every SCHEDULED or RUNNING job is either re-admitted
    /// (next instant still ahead) or cancelled as too late.
    ///
    /// In a cluster the table is shared with members that may be running their
    /// jobs right now, so only rows assigned to this instance are touched. The
    /// rest belongs to the master's orphan reassignment.
    pub fn reschedule_all(&self) -> Result<RescheduleReport> {
        let mut jobs = {
            let mut tx = self.inner.store.begin()?;
            tx.list_by_status(&[JobStatus::Scheduled, JobStatus::Running])?
        };
        if let Some(own) = self.inner.runner.runner_id() {
            let found = jobs.len();
            jobs.retain(|job| job.runner_id.as_deref() == Some(own));
            debug!(
                skipped = found - jobs.len(),
                runner_id = %own,
                "Leaving jobs of other cluster members alone"
            );
        }
        debug!(count = jobs.len(), "Found jobs to reschedule");

        let now = Utc::now();
        let horizon = now + Duration::seconds(SCHEDULE_MARGIN_SECS);
        let mut report = RescheduleReport::default();
        for job in jobs {
            let Some(id) = job.id else { continue };
            let result = match job.next_execution(now) {
                Some(when) if when > horizon => {
                    self.add(job).map(|_| report.readmitted.push(id))
                }
                _ => self.cancel(id, STARTUP_TOO_LATE).map(|_| report.cancelled.push(id)),
            };
            if let Err(e) = result {
                error!(job_id = %id, error = %e, "Unable to reschedule the job");
            }
        }
        info!(
            readmitted = report.readmitted.len(),
            cancelled = report.cancelled.len(),
            "Jobs rescheduled after startup"
        );
        Ok(report)
    }

    /// Cluster mode: hand a new job to a runner and park it as WAITING.
    pub fn assign_runner(
        &self,
        mut job: Job,
        selector: &dyn RunnerSelector,
        candidates: &[RunnerCandidate],
    ) -> Result<JobId> {
        let runner_id = selector
            .select(candidates, job.runner_hash())
            .ok_or_else(|| anyhow!("no runner available"))?;
        if let Some(handler) = self.inner.runner.handlers().get(job.job_type()) {
            handler.on_schedule(&mut job);
        }
        job.runner_id = Some(runner_id.clone());
        job.set_status(JobStatus::Waiting);
        let id = self.save(&mut job)?;
        info!(job_id = %id, runner_id = %runner_id, "Job assigned to runner");
        Ok(id)
    }

    /// Cluster mode: move WAITING/RUNNING jobs off runners that left the set.
    /// Returns the ids that got a new runner.
    pub fn reassign_orphans(
        &self,
        selector: &dyn RunnerSelector,
        candidates: &[RunnerCandidate],
    ) -> Result<Vec<JobId>> {
        let runners = RunnerSet::from_candidates(candidates);
        let mut tx = self.inner.store.begin()?;
        let mut moved = Vec::new();
        for mut job in tx.list_by_status(&[JobStatus::Waiting, JobStatus::Running])? {
            let orphan = match &job.runner_id {
                Some(runner_id) => !runners.contains(runner_id),
                None => true,
            };
            if !orphan {
                continue;
            }
            let Some(runner_id) = selector.select(candidates, job.runner_hash()) else {
                warn!("No runner left to take orphan jobs");
                break;
            };
            job.runner_id = Some(runner_id);
            job.set_status(JobStatus::Waiting);
            moved.push(tx.save(&mut job)?);
        }
        tx.commit()?;
        if !moved.is_empty() {
            info!(count = moved.len(), "Orphan jobs reassigned");
        }
        Ok(moved)
    }

    /// Admit the WAITING jobs assigned to this instance. Returns how many were added.
    pub fn schedule_local_jobs(&self, runner_id: &str) -> Result<usize> {
        let jobs = {
            let mut tx = self.inner.store.begin()?;
            tx.list_waiting_for_runner(runner_id)?
        };
        let mut added = 0;
        for job in jobs {
            let id = job.id;
            match self.add(job) {
                Ok(_) => added += 1,
                Err(e) => error!(job_id = ?id, error = %e, "Unable to schedule the local job"),
            }
        }
        Ok(added)
    }

    /// Number of jobs with a pending or running trigger.
    pub fn tracked(&self) -> usize {
        self.triggers().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.triggers()
            .map(|t| t.values().any(|tr| tr.job_id == id && tr.running))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------

    fn triggers(&self) -> Result<MutexGuard<'_, HashMap<String, Trigger>>> {
        self.inner
            .triggers
            .lock()
            .map_err(|_| anyhow!("trigger table lock poisoned"))
    }

    fn is_tracked(&self, identity: &str) -> Result<bool> {
        Ok(self.triggers()?.contains_key(identity))
    }

    fn load(&self, id: JobId) -> Result<Job> {
        let mut tx = self.inner.store.begin()?;
        tx.get(id)?
            .ok_or_else(|| NetwardenError::NotFound(format!("job {id}")).into())
    }

    fn save(&self, job: &mut Job) -> Result<JobId> {
        let mut tx = self.inner.store.begin()?;
        let id = tx.save(job)?;
        tx.commit()?;
        Ok(id)
    }

    fn arm(&self, identity: String, id: JobId, when: Option<DateTime<Utc>>) -> Result<()> {
        let mut triggers = self.triggers()?;
        if triggers.contains_key(&identity) {
            return Ok(());
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(
            fire(self.clone(), identity.clone(), generation, id, when, cancel.clone())
                .instrument(Span::current()),
        );
        triggers.insert(
            identity,
            Trigger {
                generation,
                job_id: id,
                running: false,
                abort: Some(handle.abort_handle()),
                cancel,
            },
        );
        Ok(())
    }

    /// Flip a pending trigger to running. False if it was cancelled meanwhile.
    fn claim(&self, identity: &str, generation: u64) -> bool {
        match self.triggers() {
            Ok(mut triggers) => match triggers.get_mut(identity) {
                Some(trigger) if trigger.generation == generation => {
                    trigger.running = true;
                    trigger.abort = None;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn release(&self, identity: &str, generation: u64) {
        if let Ok(mut triggers) = self.triggers() {
            if triggers.get(identity).map(|t| t.generation) == Some(generation) {
                triggers.remove(identity);
            }
        }
    }
}

/// Body of a trigger task.
async fn fire(
    scheduler: JobScheduler,
    identity: String,
    generation: u64,
    id: JobId,
    when: Option<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
) {
    if let Some(when) = when {
        let delay = (when - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(delay).await;
    }

    let Ok(_permit) = scheduler.inner.permits.clone().acquire_owned().await else {
        return;
    };
    if !scheduler.claim(&identity, generation) {
        return;
    }

    let result = scheduler.inner.runner.execute(id, cancel).await;
    scheduler.release(&identity, generation);

    match result {
        Ok(report) => {
            if let Some(successor) = report.successor {
                if let Err(e) = scheduler.add(successor) {
                    error!(job_id = %id, error = %e, "Unable to schedule the next occurrence");
                }
            }
        }
        Err(e) => error!(job_id = %id, error = %e, "Job execution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ScheduleType;
    use crate::handler::{HandlerRegistry, JobContext, JobHandler};
    use crate::job::{JobPayload, JobType};
    use crate::placement::WeightedRunnerSelector;
    use crate::store::SqliteJobStore;
    use async_trait::async_trait;
    use netwarden_hooks::HookPipeline;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Quick(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Quick {
        async fn run(&self, job: &mut Job, _ctx: &JobContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            job.set_status(JobStatus::Success);
            Ok(())
        }
    }

    /// Blocks until released; honors the cancel flag.
    struct Gated {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for Gated {
        async fn run(&self, job: &mut Job, ctx: &JobContext) -> anyhow::Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            if ctx.is_cancelled() {
                job.log.info("stopping early");
            }
            job.set_status(JobStatus::Success);
            Ok(())
        }
    }

    fn scheduler_with(handler: Arc<dyn JobHandler>) -> JobScheduler {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let mut handlers = HandlerRegistry::new();
        handlers.register(JobType::RunDiagnostics, handler);
        let runner = JobRunner::new(
            store.clone(),
            Arc::new(handlers),
            HookPipeline::default(),
            None,
        );
        JobScheduler::new(store, runner, 4)
    }

    fn status_of(scheduler: &JobScheduler, id: JobId) -> JobStatus {
        scheduler.load(id).unwrap().status
    }

    async fn wait_for_status(scheduler: &JobScheduler, id: JobId, status: JobStatus) {
        for _ in 0..200 {
            if status_of(scheduler, id) == status {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    fn job() -> Job {
        Job::new(JobPayload::RunDiagnostics { device_id: 1 }, "tester")
    }

    #[tokio::test]
    async fn test_asap_job_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_with(Arc::new(Quick(runs.clone())));

        let id = scheduler.add(job()).unwrap();
        wait_for_status(&scheduler, id, JobStatus::Success).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.tracked(), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_drops_trigger() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_with(Arc::new(Quick(runs.clone())));

        let later = Utc::now() + Duration::hours(2);
        let id = scheduler
            .add(job().with_schedule(ScheduleType::At, 1, later))
            .unwrap();
        assert_eq!(status_of(&scheduler, id), JobStatus::Scheduled);
        assert_eq!(scheduler.tracked(), 1);

        scheduler.cancel(id, "Cancelled by admin").unwrap();
        assert_eq!(scheduler.tracked(), 0);
        let cancelled = scheduler.load(id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.log.text().contains("[WARN] Cancelled by admin"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_job_only_sets_flag() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let scheduler = scheduler_with(Arc::new(Gated {
            started: started.clone(),
            release: release.clone(),
        }));

        let id = scheduler.add(job()).unwrap();
        started.notified().await;
        assert!(scheduler.is_running(id));

        scheduler.cancel(id, "Operator abort").unwrap();
        // still tracked until the body returns
        assert!(scheduler.is_running(id));

        release.notify_one();
        wait_for_status(&scheduler, id, JobStatus::Cancelled).await;
        for _ in 0..100 {
            if scheduler.load(id).unwrap().log.text().contains("stopping early") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // the reason written by cancel survives the runner's final save
        let log = scheduler.load(id).unwrap().log.text().to_string();
        assert!(log.contains("[WARN] Operator abort"));
        assert!(log.contains("[INFO] stopping early"));
        for _ in 0..100 {
            if scheduler.tracked() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.tracked(), 0);
    }

    #[tokio::test]
    async fn test_assign_and_schedule_local_jobs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler_with(Arc::new(Quick(runs.clone())));
        let candidates = [RunnerCandidate {
            instance_id: "local-runner".into(),
            runner_priority: 100,
            runner_weight: 100,
        }];

        let id = scheduler
            .assign_runner(job(), &WeightedRunnerSelector, &candidates)
            .unwrap();
        let waiting = scheduler.load(id).unwrap();
        assert_eq!(waiting.status, JobStatus::Waiting);
        assert_eq!(waiting.runner_id.as_deref(), Some("local-runner"));

        assert_eq!(scheduler.schedule_local_jobs("someone-else").unwrap(), 0);
        assert_eq!(scheduler.schedule_local_jobs("local-runner").unwrap(), 1);
        wait_for_status(&scheduler, id, JobStatus::Success).await;
    }

    #[tokio::test]
    async fn test_orphans_move_to_remaining_runner() {
        let scheduler = scheduler_with(Arc::new(Quick(Arc::new(AtomicUsize::new(0)))));
        let both = [
            RunnerCandidate { instance_id: "a".into(), runner_priority: 1, runner_weight: 1 },
            RunnerCandidate { instance_id: "b".into(), runner_priority: 1, runner_weight: 1 },
        ];
        let mut ids = Vec::new();
        for device_id in 1..=6 {
            let job = Job::new(JobPayload::RunDiagnostics { device_id }, "t");
            ids.push(scheduler.assign_runner(job, &WeightedRunnerSelector, &both).unwrap());
        }

        let survivor = [both[1].clone()];
        scheduler.reassign_orphans(&WeightedRunnerSelector, &survivor).unwrap();
        for id in ids {
            assert_eq!(scheduler.load(id).unwrap().runner_id.as_deref(), Some("b"));
        }
    }
}
