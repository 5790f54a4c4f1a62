//! Process logging.
//!
//! Operators read the console; the daily NDJSON file is for tooling. Everything
//! a server does runs under the span from [`instance_span`], so in a cluster
//! each file line carries the `instance_id` of the member that wrote it.

use std::path::Path;

use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Base name of the rolling log file (`netwarden.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "netwarden.log";

/// Keeps the background file writer alive. Dropping it flushes what is queued.
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggerGuard {
    _file: WorkerGuard,
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// Returns `None` when a subscriber is already installed.
pub fn init_logger<P: AsRef<Path>>(log_dir: P, level: &str) -> Option<LoggerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .ok()
        .map(|()| LoggerGuard { _file: guard })
}

/// Root span of a server process. Tasks spawned under it must be instrumented
/// with `Span::current()` to keep the field.
pub fn instance_span(instance_id: Option<&str>) -> Span {
    match instance_id {
        Some(id) => tracing::info_span!("netwarden", instance_id = %id),
        None => tracing::info_span!("netwarden"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_span_carries_id_only_in_cluster_mode() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let clustered = instance_span(Some("01ff0123456789ab1f90"));
            let meta = clustered.metadata().unwrap();
            assert_eq!(meta.name(), "netwarden");
            assert!(meta.fields().field("instance_id").is_some());

            let standalone = instance_span(None);
            assert!(standalone.metadata().unwrap().fields().field("instance_id").is_none());
        });
    }
}
