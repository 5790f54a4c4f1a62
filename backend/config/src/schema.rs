//! netwarden runtime configuration schema.
//!
//! Every section has serde defaults so a partial (or empty) YAML file is valid.

use serde::{Deserialize, Serialize};

use crate::defaults::*;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetwardenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Job execution settings
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Multi-instance clustering
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// SQLite database shared by the jobs table and the cluster notification table.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: DEFAULT_DB_PATH.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TasksConfig {
    /// Maximum number of jobs running concurrently in this process.
    pub thread_count: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self { thread_count: DEFAULT_THREAD_COUNT }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Fixed instance id (20 chars, `[0-9a-z]`). Derived from the host when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub master_priority: i32,
    pub runner_priority: i32,
    pub runner_weight: i32,
    /// Port mixed into the hardware-derived instance id.
    pub service_port: u16,
    pub hello_interval_secs: u64,
    pub negotiating_hello_interval_secs: u64,
    pub hold_time_secs: u64,
    pub negotiation_secs: u64,
    pub receive_timeout_ms: u64,
    pub drift_warning_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_factor: u32,
    pub channel: String,
    pub auto_snapshot_window_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            id: None,
            master_priority: DEFAULT_PRIORITY,
            runner_priority: DEFAULT_PRIORITY,
            runner_weight: DEFAULT_RUNNER_WEIGHT,
            service_port: DEFAULT_SERVICE_PORT,
            hello_interval_secs: DEFAULT_HELLO_INTERVAL_SECS,
            negotiating_hello_interval_secs: DEFAULT_NEGOTIATING_HELLO_INTERVAL_SECS,
            hold_time_secs: DEFAULT_HOLD_TIME_SECS,
            negotiation_secs: DEFAULT_NEGOTIATION_SECS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            drift_warning_secs: DEFAULT_DRIFT_WARNING_SECS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_factor: DEFAULT_RECONNECT_MAX_FACTOR,
            channel: DEFAULT_CLUSTER_CHANNEL.to_string(),
            auto_snapshot_window_secs: DEFAULT_AUTO_SNAPSHOT_WINDOW_SECS,
        }
    }
}
