//! `netwarden jobs`: list jobs straight from the job database.

use anyhow::{bail, Result};
use chrono::SecondsFormat;

use netwarden_config::NetwardenConfig;
use netwarden_scheduler::{Job, JobStatus, JobStore, SqliteJobStore};

use crate::terminal_output::{render_table, status_cell, Column};

pub fn run(config: &NetwardenConfig, limit: usize, status: Option<&str>) -> Result<()> {
    let store = SqliteJobStore::open(&config.database.path)?;
    let mut tx = store.begin()?;
    let jobs = match status {
        Some(raw) => {
            let Some(status) = JobStatus::parse(&raw.to_ascii_uppercase()) else {
                bail!("unknown job status '{raw}'");
            };
            let mut jobs = tx.list_by_status(&[status])?;
            jobs.reverse();
            jobs.truncate(limit);
            jobs
        }
        None => tx.list_recent(limit)?,
    };
    tx.rollback()?;

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    print!("{}", render_table(&columns(), &rows(&jobs)));
    Ok(())
}

fn columns() -> Vec<Column> {
    vec![
        Column::right("ID"),
        Column::left("TYPE"),
        Column::left("STATUS"),
        Column::left("SCHEDULE"),
        Column::left("RUNNER"),
        Column::left("CHANGED"),
        Column::left("AUTHOR"),
    ]
}

fn rows(jobs: &[Job]) -> Vec<Vec<String>> {
    jobs.iter()
        .map(|job| {
            vec![
                job.id.map(|id| id.to_string()).unwrap_or_default(),
                job.job_type().to_string(),
                status_cell(job.status),
                format!("{}x{}", job.schedule_type, job.schedule_factor),
                job.runner_id.clone().unwrap_or_else(|| "-".to_string()),
                job.change_date.to_rfc3339_opts(SecondsFormat::Secs, true),
                job.author.clone(),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netwarden_scheduler::JobPayload;

    #[test]
    fn rows_describe_jobs() {
        let mut job = Job::new(JobPayload::PurgeDatabase { days: 30 }, "admin");
        job.id = Some(netwarden_scheduler::JobId(4));
        let rows = rows(&[job]);
        assert_eq!(rows[0][0], "4");
        assert_eq!(rows[0][1], "PurgeDatabase");
        assert_eq!(rows[0][4], "-");
        assert_eq!(rows[0][6], "admin");
    }
}
