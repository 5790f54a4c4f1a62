//! Config validation: checks with user-friendly error messages and config paths.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::defaults::{MAX_RUNNER_WEIGHT, MIN_RUNNER_WEIGHT};
use crate::schema::NetwardenConfig;

static INSTANCE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-z]{20}$").unwrap());

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Whether `id` is acceptable as a configured cluster instance id.
pub fn is_valid_instance_id(id: &str) -> bool {
    INSTANCE_ID_PATTERN.is_match(id)
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &NetwardenConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_database(config, &mut report);
    validate_tasks(config, &mut report);
    validate_cluster(config, &mut report);
    report
}

fn validate_database(config: &NetwardenConfig, report: &mut ValidationReport) {
    if config.database.path.trim().is_empty() {
        report.error("database.path", "Database path cannot be empty");
    }
}

fn validate_tasks(config: &NetwardenConfig, report: &mut ValidationReport) {
    if config.tasks.thread_count == 0 {
        report.error("tasks.threadCount", "threadCount must be >= 1");
    }
}

fn validate_cluster(config: &NetwardenConfig, report: &mut ValidationReport) {
    let cluster = &config.cluster;
    if let Some(id) = &cluster.id {
        if !is_valid_instance_id(id) {
            report.error(
                "cluster.id",
                "Invalid instance id (expected 20 characters in [0-9a-z]), one will be generated",
            );
        }
    }
    if !(MIN_RUNNER_WEIGHT..=MAX_RUNNER_WEIGHT).contains(&cluster.runner_weight) {
        report.error(
            "cluster.runnerWeight",
            format!("runnerWeight must be between {MIN_RUNNER_WEIGHT} and {MAX_RUNNER_WEIGHT}"),
        );
    }
    if !cluster.enabled {
        return;
    }
    if cluster.hold_time_secs <= cluster.hello_interval_secs {
        report.warn(
            "cluster.holdTimeSecs",
            "holdTimeSecs should be several times helloIntervalSecs; peers may flap to EXPIRED",
        );
    }
    if cluster.receive_timeout_ms >= cluster.hello_interval_secs.saturating_mul(1000) {
        report.warn(
            "cluster.receiveTimeoutMs",
            "receiveTimeoutMs is longer than the hello interval; heartbeats will be late",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let report = validate(&NetwardenConfig::default());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn malformed_instance_id_is_error() {
        let mut cfg = NetwardenConfig::default();
        cfg.cluster.id = Some("NOT-A-VALID-ID".to_string());
        let report = validate(&cfg);
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].path, "cluster.id");
    }

    #[test]
    fn well_formed_instance_id_passes() {
        assert!(is_valid_instance_id("01ff0a1b2c3d4e5f20fb"));
        assert!(!is_valid_instance_id("01ff0a1b2c3d4e5f20f"));
        assert!(!is_valid_instance_id("01FF0A1B2C3D4E5F20FB"));
    }

    #[test]
    fn short_hold_time_warns_when_enabled() {
        let mut cfg = NetwardenConfig::default();
        cfg.cluster.enabled = true;
        cfg.cluster.hold_time_secs = 5;
        let report = validate(&cfg);
        assert!(report.is_valid());
        assert_eq!(report.warnings[0].path, "cluster.holdTimeSecs");
    }
}
