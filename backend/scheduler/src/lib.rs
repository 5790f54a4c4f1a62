pub mod clock;
pub mod handler;
pub mod job;
pub mod placement;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use clock::{next_execution, ScheduleType};
pub use handler::{HandlerRegistry, JobContext, JobHandler, PurgeDatabaseHandler};
pub use job::{Job, JobId, JobLog, JobPayload, JobStatus, JobType};
pub use placement::{RunnerCandidate, RunnerSelector, RunnerSet, WeightedRunnerSelector};
pub use runner::{ExecutionReport, JobRunner, RunnerError};
pub use scheduler::{JobScheduler, RescheduleReport};
pub use store::{JobStore, JobTransaction, SqliteJobStore};
