//! Job handlers: the per-type behavior behind the common job lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use netwarden_core::NetwardenError;

use crate::job::{Job, JobPayload, JobStatus, JobType};
use crate::store::{JobStore, JobTransaction};

/// Runtime context handed to a running job body.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Instance id of the local cluster member, if clustering is on.
    pub runner_id: Option<String>,
    cancel: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(runner_id: Option<String>, cancel: Arc<AtomicBool>) -> Self {
        Self { runner_id, cancel }
    }

    /// Set once the job has been cancelled. Bodies that can stop early should poll it.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Behavior of one job type.
///
/// `prepare` runs inside the transaction that marks the job RUNNING; `run` runs
/// after that transaction is committed and may take as long as it needs. A body
/// is expected to leave the job in a terminal status; one that stays RUNNING is
/// failed by the runner.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Called before the job is saved as SCHEDULED.
    fn on_schedule(&self, _job: &mut Job) {}

    /// Called before the job is saved as CANCELLED.
    fn on_cancel(&self, _job: &mut Job) {}

    /// Load anything the body needs that is only reachable through the store.
    fn prepare(&self, _job: &mut Job, _tx: &mut dyn JobTransaction) -> Result<()> {
        Ok(())
    }

    async fn run(&self, job: &mut Job, ctx: &JobContext) -> Result<()>;
}

/// Handlers by job type. Built once at startup and shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

/// Deletes finished jobs that have not changed for the configured number of days.
pub struct PurgeDatabaseHandler {
    store: Arc<dyn JobStore>,
}

impl PurgeDatabaseHandler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

}

fn purge(store: &dyn JobStore, days: u32) -> Result<usize> {
    let before = Utc::now()
        .checked_sub_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| {
            NetwardenError::InvalidJob(format!("a retention of {days} days is out of range"))
        })?;
    let mut tx = store.begin()?;
    let deleted = tx.purge_finished_before(before)?;
    tx.commit()?;
    Ok(deleted)
}

#[async_trait]
impl JobHandler for PurgeDatabaseHandler {
    async fn run(&self, job: &mut Job, _ctx: &JobContext) -> Result<()> {
        let JobPayload::PurgeDatabase { days } = job.payload else {
            anyhow::bail!("{} is not a purge job", job.identity());
        };
        job.log.info(format!("Purging finished jobs older than {days} days"));
        let store = Arc::clone(&self.store);
        let deleted = tokio::task::spawn_blocking(move || purge(store.as_ref(), days)).await??;
        job.log.info(format!("{deleted} job(s) deleted"));
        job.set_status(JobStatus::Success);
        Ok(())
    }
}
