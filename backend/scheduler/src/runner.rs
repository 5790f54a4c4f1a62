//! Transactional job execution.
//!
//! A run goes through three phases, each with its own result:
//! 1. start: load, prepare and mark RUNNING in one transaction
//! 2. body: the handler's `run`, outside any transaction, isolated in its own task
//! 3. finish: persist the terminal state, falling back to a forced FAILURE
//!
//! After that, post-job hooks fire and recurring jobs yield their next occurrence.
//! Phases 1 and 3 talk to SQLite synchronously, so they run on the blocking pool.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use netwarden_hooks::HookPipeline;

use crate::handler::{HandlerRegistry, JobContext};
use crate::job::{Job, JobId, JobStatus};
use crate::store::{JobStore, JobTransaction};

/// Failures `execute` reports to its caller. Everything else ends up in the job status.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("could not start job {id}: {source}")]
    Prepare {
        id: JobId,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not persist any terminal state for job {id}: {source}")]
    Persist {
        id: JobId,
        #[source]
        source: anyhow::Error,
    },

    #[error("store task for job {id} did not complete: {source}")]
    StoreTask {
        id: JobId,
        #[source]
        source: JoinError,
    },
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Next job of a recurring series, not yet persisted.
    pub successor: Option<Job>,
}

pub struct JobRunner {
    persistence: Persistence,
    hooks: HookPipeline,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        hooks: HookPipeline,
        runner_id: Option<String>,
    ) -> Self {
        Self {
            persistence: Persistence { store, handlers, runner_id },
            hooks,
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.persistence.handlers
    }

    /// Cluster instance id stamped on started jobs, `None` when standalone.
    pub fn runner_id(&self) -> Option<&str> {
        self.persistence.runner_id.as_deref()
    }

    pub async fn execute(
        &self,
        id: JobId,
        cancel: Arc<AtomicBool>,
    ) -> Result<ExecutionReport, RunnerError> {
        let job = self.blocking(id, move |p| p.start(id)).await?;
        info!(job_id = %id, job_type = %job.job_type(), "Job started");

        let mut job = self.run_body(job, cancel).await;
        if job.status == JobStatus::Running {
            warn!(job_id = %id, "Job body returned without a terminal status");
            job.log.error("The job did not report a final status");
            job.set_status(JobStatus::Failure);
        }

        let job = self.blocking(id, move |p| p.finish(job)).await?;
        info!(job_id = %id, status = %job.status, "Job finished");

        self.fire_hooks(&job).await;

        let successor = (job.is_repeating() && job.status != JobStatus::Cancelled)
            .then(|| job.next_occurrence());
        Ok(ExecutionReport { job_id: id, status: job.status, successor })
    }

    async fn blocking<T, F>(&self, id: JobId, work: F) -> Result<T, RunnerError>
    where
        T: Send + 'static,
        F: FnOnce(&Persistence) -> Result<T, RunnerError> + Send + 'static,
    {
        let persistence = self.persistence.clone();
        tokio::task::spawn_blocking(move || work(&persistence))
            .await
            .map_err(|source| RunnerError::StoreTask { id, source })?
    }

    async fn run_body(&self, mut job: Job, cancel: Arc<AtomicBool>) -> Job {
        let Some(handler) = self.persistence.handlers.get(job.job_type()) else {
            error!(job_type = %job.job_type(), "No handler registered for job type");
            job.log.error(format!("No handler available for {} jobs", job.job_type()));
            job.set_status(JobStatus::Failure);
            return job;
        };

        let fallback = job.clone();
        let ctx = JobContext::new(self.persistence.runner_id.clone(), cancel);
        let body = tokio::spawn(async move {
            let result = handler.run(&mut job, &ctx).await;
            (job, result)
        });

        match body.await {
            Ok((job, Ok(()))) => job,
            Ok((mut job, Err(e))) => {
                error!(job_id = ?job.id, error = %e, "Error while running the job");
                job.log.error(format!("Error while running the job: {e:#}"));
                job
            }
            Err(join_error) => {
                error!(job_id = ?fallback.id, error = %join_error, "Job body crashed");
                let mut job = fallback;
                job.log.error(format!("Fatal error while running the job: {join_error}"));
                job.set_status(JobStatus::Failure);
                job
            }
        }
    }

    async fn fire_hooks(&self, job: &Job) {
        let payload = job.hook_payload();
        for outcome in self.hooks.after_job(&payload).await {
            match outcome.result {
                Ok(line) => debug!(job_id = payload.job_id, hook = %outcome.hook, "{}", line),
                Err(e) => warn!(job_id = payload.job_id, hook = %outcome.hook, error = %e, "Hook failed"),
            }
        }
    }
}

/// The store side of a run.
#[derive(Clone)]
struct Persistence {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    runner_id: Option<String>,
}

impl Persistence {
    fn start(&self, id: JobId) -> Result<Job, RunnerError> {
        let prepare_err = |source: anyhow::Error| RunnerError::Prepare { id, source };

        let mut tx = self.store.begin().map_err(prepare_err)?;
        let mut job = match tx.get(id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %id, "Job to execute does not exist");
                return Err(RunnerError::NotFound(id));
            }
            Err(e) => return Err(prepare_err(e)),
        };

        if let Some(handler) = self.handlers.get(job.job_type()) {
            if let Err(e) = handler.prepare(&mut job, tx.as_mut()) {
                error!(job_id = %id, error = %e, "Job preparation failed");
                discard(tx, id);
                if let Err(mark_err) = self.fail_unprepared(id, &e) {
                    error!(job_id = %id, error = %mark_err, "Unable to mark the unprepared job as failed");
                }
                return Err(prepare_err(e));
            }
        }

        job.set_running();
        if let Some(runner_id) = &self.runner_id {
            job.runner_id = Some(runner_id.clone());
        }
        if let Err(e) = tx.save(&mut job) {
            discard(tx, id);
            return Err(prepare_err(e));
        }
        tx.commit().map_err(prepare_err)?;
        Ok(job)
    }

    /// A job whose preparation failed would otherwise stay SCHEDULED with no trigger.
    fn fail_unprepared(&self, id: JobId, cause: &anyhow::Error) -> anyhow::Result<()> {
        let mut tx = self.store.begin()?;
        let Some(mut job) = tx.get(id)? else {
            return Ok(());
        };
        job.log.error(format!("Unable to prepare the job: {cause:#}"));
        job.set_status(JobStatus::Failure);
        tx.save(&mut job)?;
        tx.commit()
    }

    /// Persist the terminal state. If that fails, reload the row and force FAILURE.
    fn finish(&self, mut job: Job) -> Result<Job, RunnerError> {
        let id = job.id.ok_or_else(|| RunnerError::Persist {
            id: JobId(0),
            source: anyhow::anyhow!("finished job has no id"),
        })?;

        match self.save_final(&mut job) {
            Ok(()) => Ok(job),
            Err(e) => {
                error!(job_id = %id, error = %e, "Error while saving the final state of the job");
                self.force_failure(id).map_err(|source| {
                    error!(job_id = %id, error = %source, "Unable to save the job even as failed");
                    RunnerError::Persist { id, source }
                })
            }
        }
    }

    fn save_final(&self, job: &mut Job) -> anyhow::Result<()> {
        let mut tx = self.store.begin()?;
        if let Some(id) = job.id {
            if let Some(stored) = tx.get(id)? {
                // a cancel issued while the body ran wins over the body's own verdict
                if stored.status == JobStatus::Cancelled && job.status != JobStatus::Cancelled {
                    job.log.warn("The job was cancelled while running");
                    job.set_status(JobStatus::Cancelled);
                }
                job.log.merge_stored(&stored.log);
            }
        }
        // an early return drops the transaction, which rolls it back
        tx.save(job)?;
        tx.commit()
    }

    fn force_failure(&self, id: JobId) -> anyhow::Result<Job> {
        let mut tx = self.store.begin()?;
        let mut job = tx
            .get(id)?
            .ok_or_else(|| anyhow::anyhow!("job {id} disappeared"))?;
        job.log.error("Unable to save the result of the job");
        job.set_status(JobStatus::Failure);
        tx.save(&mut job)?;
        tx.commit()?;
        Ok(job)
    }
}

fn discard(tx: Box<dyn JobTransaction + '_>, id: JobId) {
    if let Err(e) = tx.rollback() {
        warn!(job_id = %id, error = %e, "Rollback failed");
    }
}
