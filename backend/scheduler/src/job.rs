//! The persisted job record and its per-job operator log.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use netwarden_hooks::PostJobPayload;
use netwarden_logging::redact_sensitive_data;

use crate::clock::{self, ScheduleType};

/// Scheduler priority given to jobs unless the caller overrides it.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Database identity of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Scheduled,
    Waiting,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Scheduled => "SCHEDULED",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "SCHEDULED" => Some(Self::Scheduled),
            "WAITING" => Some(Self::Waiting),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of [`JobPayload`], used for handler lookup, hook matching and identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    TakeSnapshot,
    CheckCompliance,
    RunDiagnostics,
    RunDeviceScript,
    ScanSubnets,
    PurgeDatabase,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        Self::TakeSnapshot,
        Self::CheckCompliance,
        Self::RunDiagnostics,
        Self::RunDeviceScript,
        Self::ScanSubnets,
        Self::PurgeDatabase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeSnapshot => "TakeSnapshot",
            Self::CheckCompliance => "CheckCompliance",
            Self::RunDiagnostics => "RunDiagnostics",
            Self::RunDeviceScript => "RunDeviceScript",
            Self::ScanSubnets => "ScanSubnets",
            Self::PurgeDatabase => "PurgeDatabase",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does. The lifecycle fields live on [`Job`]; this is only the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum JobPayload {
    TakeSnapshot {
        device_id: i64,
        /// Triggered by a device event rather than an operator.
        #[serde(default)]
        automatic: bool,
        #[serde(default)]
        dont_run_diagnostics: bool,
        #[serde(default)]
        dont_check_compliance: bool,
    },
    CheckCompliance {
        device_id: i64,
    },
    RunDiagnostics {
        device_id: i64,
    },
    RunDeviceScript {
        device_id: i64,
        script: String,
        driver: String,
    },
    ScanSubnets {
        subnets: Vec<String>,
        #[serde(default)]
        domain_id: Option<i64>,
    },
    PurgeDatabase {
        /// Finished jobs older than this many days are deleted.
        days: u32,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::TakeSnapshot { .. } => JobType::TakeSnapshot,
            Self::CheckCompliance { .. } => JobType::CheckCompliance,
            Self::RunDiagnostics { .. } => JobType::RunDiagnostics,
            Self::RunDeviceScript { .. } => JobType::RunDeviceScript,
            Self::ScanSubnets { .. } => JobType::ScanSubnets,
            Self::PurgeDatabase { .. } => JobType::PurgeDatabase,
        }
    }

    /// Device the job works on, if it is bound to one.
    pub fn device_id(&self) -> Option<i64> {
        match self {
            Self::TakeSnapshot { device_id, .. }
            | Self::CheckCompliance { device_id }
            | Self::RunDiagnostics { device_id }
            | Self::RunDeviceScript { device_id, .. } => Some(*device_id),
            Self::ScanSubnets { .. } | Self::PurgeDatabase { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn label(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Operator-visible log of a job.
///
/// Every line is `<RFC3339> [LEVEL] message` with device secrets masked. Trace
/// lines only go to the debug log, which exists only while debugging is enabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobLog {
    logs: String,
    debug_log: Option<String>,
    debug_enabled: bool,
}

impl JobLog {
    pub fn restore(logs: String, debug_log: Option<String>, debug_enabled: bool) -> Self {
        Self { logs, debug_log, debug_enabled }
    }

    pub fn set_debug_enabled(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
        if enabled && self.debug_log.is_none() {
            self.debug_log = Some(String::new());
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    pub fn text(&self) -> &str {
        &self.logs
    }

    pub fn debug_text(&self) -> Option<&str> {
        self.debug_log.as_deref()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
        if let Some(debug) = self.debug_log.as_mut() {
            debug.clear();
        }
    }

    /// Fold in what was appended to the stored copy of this log since both
    /// diverged, such as a cancel reason. Stored lines come first.
    pub fn merge_stored(&mut self, stored: &JobLog) {
        self.logs = merge_lines(&stored.logs, &self.logs);
        if let (Some(theirs), Some(ours)) = (stored.debug_log.as_deref(), self.debug_log.as_mut()) {
            *ours = merge_lines(theirs, ours);
        }
    }

    pub fn trace(&mut self, message: impl AsRef<str>) {
        self.write(LogLevel::Trace, message.as_ref());
    }

    pub fn debug(&mut self, message: impl AsRef<str>) {
        self.write(LogLevel::Debug, message.as_ref());
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.write(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.write(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.write(LogLevel::Error, message.as_ref());
    }

    fn write(&mut self, level: LogLevel, message: &str) {
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level.label(),
            redact_sensitive_data(message)
        );
        if self.debug_enabled {
            self.debug_log.get_or_insert_with(String::new).push_str(&line);
        }
        if level != LogLevel::Trace {
            self.logs.push_str(&line);
        }
    }
}

fn merge_lines(stored: &str, ours: &str) -> String {
    let shared: usize = stored
        .split_inclusive('\n')
        .zip(ours.split_inclusive('\n'))
        .take_while(|(theirs, mine)| theirs == mine)
        .map(|(line, _)| line.len())
        .sum();
    let mut merged = String::with_capacity(stored.len() + ours.len() - shared);
    merged.push_str(stored);
    merged.push_str(&ours[shared..]);
    merged
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Job {
    /// `None` until first saved.
    pub id: Option<JobId>,
    pub status: JobStatus,
    pub schedule_type: ScheduleType,
    pub schedule_factor: i32,
    pub schedule_reference: DateTime<Utc>,
    pub priority: i32,
    /// Cluster member assigned to run this job.
    pub runner_id: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub execution_date: Option<DateTime<Utc>>,
    pub change_date: DateTime<Utc>,
    pub log: JobLog,
    pub target: String,
    pub author: String,
    pub comments: String,
    pub payload: JobPayload,
}

impl Job {
    /// A new job to run as soon as possible.
    pub fn new(payload: JobPayload, author: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            status: JobStatus::New,
            schedule_type: ScheduleType::Asap,
            schedule_factor: 1,
            schedule_reference: now,
            priority: DEFAULT_PRIORITY,
            runner_id: None,
            creation_date: now,
            execution_date: None,
            change_date: now,
            log: JobLog::default(),
            target: String::new(),
            author: author.into(),
            comments: String::new(),
            payload,
        }
    }

    pub fn with_schedule(
        mut self,
        schedule_type: ScheduleType,
        factor: i32,
        reference: DateTime<Utc>,
    ) -> Self {
        self.schedule_type = schedule_type;
        self.schedule_factor = factor;
        self.schedule_reference = reference;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = comments.into();
        self
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Key used by the scheduler to keep one execution per job in flight.
    pub fn identity(&self) -> String {
        format!("{}_{}", self.job_type(), self.id.map(|id| id.0).unwrap_or(0))
    }

    /// Affinity key for runner placement: the device id, or 0 when unbound.
    pub fn runner_hash(&self) -> i64 {
        self.payload.device_id().unwrap_or(0)
    }

    pub fn is_repeating(&self) -> bool {
        self.schedule_type.is_repeating()
    }

    pub fn next_execution(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        clock::next_execution(
            self.schedule_type,
            self.schedule_factor,
            self.schedule_reference,
            now,
        )
    }

    /// Change status and refresh `change_date`. Entering `Running` stamps the execution date.
    pub fn set_status(&mut self, status: JobStatus) {
        let now = Utc::now();
        if status == JobStatus::Running {
            self.execution_date = Some(now);
        }
        self.status = status;
        self.change_date = now;
    }

    /// Start a fresh run: logs from a previous attempt are dropped.
    pub fn set_running(&mut self) {
        self.log.clear();
        self.set_status(JobStatus::Running);
    }

    /// The next job in a recurring series. Only the schedule, priority, payload and
    /// descriptive fields carry over; identity, status, runner and logs start fresh.
    pub fn next_occurrence(&self) -> Job {
        let now = Utc::now();
        Job {
            id: None,
            status: JobStatus::New,
            schedule_type: self.schedule_type,
            schedule_factor: self.schedule_factor,
            schedule_reference: self.schedule_reference,
            priority: self.priority,
            runner_id: None,
            creation_date: now,
            execution_date: None,
            change_date: now,
            log: JobLog::default(),
            target: self.target.clone(),
            author: self.author.clone(),
            comments: self.comments.clone(),
            payload: self.payload.clone(),
        }
    }

    pub fn hook_payload(&self) -> PostJobPayload {
        PostJobPayload {
            job_id: self.id.map(|id| id.0).unwrap_or(0),
            job_type: self.job_type().to_string(),
            status: self.status.to_string(),
            target: self.target.clone(),
            author: self.author.clone(),
            comments: self.comments.clone(),
            creation_date: self.creation_date,
            execution_date: self.execution_date,
            change_date: self.change_date,
            log: self.log.text().to_string(),
        }
    }
}
