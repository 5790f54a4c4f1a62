//! Durable SQLite-backed job storage with explicit transactions.
//!
//! The runner and scheduler only see the [`JobStore`] / [`JobTransaction`]
//! traits, so tests can wrap the SQLite store to inject failures.

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::{info, warn};

use netwarden_core::NetwardenError;

use crate::clock::ScheduleType;
use crate::job::{Job, JobId, JobLog, JobPayload, JobStatus};

/// Opens transactional sessions on the job table.
pub trait JobStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn JobTransaction + '_>>;
}

/// One open transaction. Dropping it without `commit` rolls back.
pub trait JobTransaction {
    fn get(&mut self, id: JobId) -> Result<Option<Job>>;

    /// Insert (no id yet) or update the job, assigning `job.id` on insert.
    fn save(&mut self, job: &mut Job) -> Result<JobId>;

    fn list_by_status(&mut self, statuses: &[JobStatus]) -> Result<Vec<Job>>;

    /// Most recently created jobs first.
    fn list_recent(&mut self, limit: usize) -> Result<Vec<Job>>;

    fn list_changed_since(&mut self, since: DateTime<Utc>) -> Result<Vec<Job>>;

    fn list_executed_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Job>>;

    /// WAITING jobs assigned to the given runner.
    fn list_waiting_for_runner(&mut self, runner_id: &str) -> Result<Vec<Job>>;

    /// Delete finished jobs whose last change is older than `before`. Returns the row count.
    fn purge_finished_before(&mut self, before: DateTime<Utc>) -> Result<usize>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

const JOB_COLUMNS: &str = "id, status, schedule_type, schedule_factor, schedule_reference, \
     priority, runner_id, creation_date, execution_date, change_date, debug_enabled, logs, \
     debug_log, target, author, comments, payload";

/// Fixed-width UTC timestamps so text comparison matches time order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in jobs table: {raw}"))?
        .with_timezone(&Utc))
}

/// SQLite job store. One connection, serialized by a mutex; a transaction holds the lock.
///
/// Calls block. The runner's start and finish phases and the purge job go
/// through `spawn_blocking`; scheduler bookkeeping (admission, cancel, startup
/// recovery, cluster reassignment) runs short statements inline and only waits
/// on the lock while a run is being started or finished.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create the job store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        info!(path = %path, "Job store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NetwardenError::StorageError("job store lock poisoned".into()).into())
    }

    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_factor INTEGER NOT NULL,
                schedule_reference TEXT NOT NULL,
                priority INTEGER NOT NULL,
                runner_id TEXT,
                creation_date TEXT NOT NULL,
                execution_date TEXT,
                change_date TEXT NOT NULL,
                debug_enabled INTEGER NOT NULL DEFAULT 0,
                logs TEXT NOT NULL DEFAULT '',
                debug_log TEXT,
                target TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                comments TEXT NOT NULL DEFAULT '',
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_creation_date ON jobs(creation_date);
            CREATE INDEX IF NOT EXISTS idx_jobs_change_date ON jobs(change_date);
            CREATE INDEX IF NOT EXISTS idx_jobs_execution_date ON jobs(execution_date);",
        )?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn begin(&self) -> Result<Box<dyn JobTransaction + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| NetwardenError::StorageError(format!("cannot begin transaction: {e}")))?;
        Ok(Box::new(SqliteTransaction { conn, finished: false }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

/// Raw column values, converted outside the rusqlite row callback.
struct JobRow {
    id: i64,
    status: String,
    schedule_type: String,
    schedule_factor: i32,
    schedule_reference: String,
    priority: i32,
    runner_id: Option<String>,
    creation_date: String,
    execution_date: Option<String>,
    change_date: String,
    debug_enabled: bool,
    logs: String,
    debug_log: Option<String>,
    target: String,
    author: String,
    comments: String,
    payload: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            schedule_type: row.get(2)?,
            schedule_factor: row.get(3)?,
            schedule_reference: row.get(4)?,
            priority: row.get(5)?,
            runner_id: row.get(6)?,
            creation_date: row.get(7)?,
            execution_date: row.get(8)?,
            change_date: row.get(9)?,
            debug_enabled: row.get::<_, i32>(10)? != 0,
            logs: row.get(11)?,
            debug_log: row.get(12)?,
            target: row.get(13)?,
            author: row.get(14)?,
            comments: row.get(15)?,
            payload: row.get(16)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .with_context(|| format!("bad payload for job {}", self.id))?;
        Ok(Job {
            id: Some(JobId(self.id)),
            status: JobStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown job status {}", self.status))?,
            schedule_type: ScheduleType::parse(&self.schedule_type)
                .ok_or_else(|| anyhow!("unknown schedule type {}", self.schedule_type))?,
            schedule_factor: self.schedule_factor,
            schedule_reference: parse_ts(&self.schedule_reference)?,
            priority: self.priority,
            runner_id: self.runner_id,
            creation_date: parse_ts(&self.creation_date)?,
            execution_date: self.execution_date.as_deref().map(parse_ts).transpose()?,
            change_date: parse_ts(&self.change_date)?,
            log: JobLog::restore(self.logs, self.debug_log, self.debug_enabled),
            target: self.target,
            author: self.author,
            comments: self.comments,
            payload,
        })
    }
}

impl SqliteTransaction<'_> {
    fn query_jobs<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs {filter}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    fn finish(&mut self, statement: &str) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch(statement)?;
        Ok(())
    }
}

impl JobTransaction for SqliteTransaction<'_> {
    fn get(&mut self, id: JobId) -> Result<Option<Job>> {
        Ok(self.query_jobs("WHERE id = ?1", params![id.0])?.into_iter().next())
    }

    fn save(&mut self, job: &mut Job) -> Result<JobId> {
        let payload = serde_json::to_string(&job.payload)?;
        let schedule_reference = fmt_ts(&job.schedule_reference);
        let creation_date = fmt_ts(&job.creation_date);
        let execution_date = job.execution_date.as_ref().map(fmt_ts);
        let change_date = fmt_ts(&job.change_date);
        let debug_enabled = job.log.debug_enabled() as i32;

        match job.id {
            None => {
                self.conn.execute(
                    "INSERT INTO jobs (job_type, status, schedule_type, schedule_factor,
                        schedule_reference, priority, runner_id, creation_date, execution_date,
                        change_date, debug_enabled, logs, debug_log, target, author, comments, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        job.job_type().as_str(),
                        job.status.as_str(),
                        job.schedule_type.as_str(),
                        job.schedule_factor,
                        schedule_reference,
                        job.priority,
                        job.runner_id,
                        creation_date,
                        execution_date,
                        change_date,
                        debug_enabled,
                        job.log.text(),
                        job.log.debug_text(),
                        job.target,
                        job.author,
                        job.comments,
                        payload,
                    ],
                )?;
                let id = JobId(self.conn.last_insert_rowid());
                job.id = Some(id);
                Ok(id)
            }
            Some(id) => {
                let changed = self.conn.execute(
                    "UPDATE jobs SET job_type = ?1, status = ?2, schedule_type = ?3,
                        schedule_factor = ?4, schedule_reference = ?5, priority = ?6,
                        runner_id = ?7, creation_date = ?8, execution_date = ?9,
                        change_date = ?10, debug_enabled = ?11, logs = ?12, debug_log = ?13,
                        target = ?14, author = ?15, comments = ?16, payload = ?17
                     WHERE id = ?18",
                    params![
                        job.job_type().as_str(),
                        job.status.as_str(),
                        job.schedule_type.as_str(),
                        job.schedule_factor,
                        schedule_reference,
                        job.priority,
                        job.runner_id,
                        creation_date,
                        execution_date,
                        change_date,
                        debug_enabled,
                        job.log.text(),
                        job.log.debug_text(),
                        job.target,
                        job.author,
                        job.comments,
                        payload,
                        id.0,
                    ],
                )?;
                if changed == 0 {
                    return Err(NetwardenError::NotFound(format!("job {id}")).into());
                }
                Ok(id)
            }
        }
    }

    fn list_by_status(&mut self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        self.query_jobs(
            &format!("WHERE status IN ({placeholders}) ORDER BY id"),
            params_from_iter(statuses.iter().map(|s| s.as_str())),
        )
    }

    fn list_recent(&mut self, limit: usize) -> Result<Vec<Job>> {
        self.query_jobs(
            "ORDER BY creation_date DESC, id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    fn list_changed_since(&mut self, since: DateTime<Utc>) -> Result<Vec<Job>> {
        self.query_jobs(
            "WHERE change_date >= ?1 ORDER BY change_date",
            params![fmt_ts(&since)],
        )
    }

    fn list_executed_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Job>> {
        self.query_jobs(
            "WHERE execution_date >= ?1 AND execution_date < ?2 ORDER BY execution_date",
            params![fmt_ts(&from), fmt_ts(&to)],
        )
    }

    fn list_waiting_for_runner(&mut self, runner_id: &str) -> Result<Vec<Job>> {
        self.query_jobs(
            "WHERE status = ?1 AND runner_id = ?2 ORDER BY priority DESC, id",
            params![JobStatus::Waiting.as_str(), runner_id],
        )
    }

    fn purge_finished_before(&mut self, before: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM jobs WHERE status IN (?1, ?2, ?3) AND change_date < ?4",
            params![
                JobStatus::Success.as_str(),
                JobStatus::Failure.as_str(),
                JobStatus::Cancelled.as_str(),
                fmt_ts(&before),
            ],
        )?;
        Ok(deleted)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.finish("COMMIT") {
            // SQLite may leave the transaction open after a failed COMMIT
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(NetwardenError::StorageError(format!("commit failed: {e}")).into());
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Rollback of abandoned job transaction failed");
            }
        }
    }
}
