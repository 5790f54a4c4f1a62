//! Telemetry and structured logging components for netwarden.
//!
//! Handles process log setup (console + rolling NDJSON file) and redaction of
//! device secrets before they land in persisted job logs.

pub mod logger;
pub mod redact;

pub use logger::{init_logger, instance_span, LoggerGuard};
pub use redact::redact_sensitive_data;
