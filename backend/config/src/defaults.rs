//! Config defaults: the default values and post-load normalization.

use tracing::error;

use crate::schema::NetwardenConfig;

pub const DEFAULT_DB_PATH: &str = "netwarden.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default size of the job worker pool.
pub const DEFAULT_THREAD_COUNT: usize = 10;

/// Default mastership and runner priority.
pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_RUNNER_WEIGHT: i32 = 100;
pub const MIN_RUNNER_WEIGHT: i32 = 1;
pub const MAX_RUNNER_WEIGHT: i32 = 1000;
pub const DEFAULT_SERVICE_PORT: u16 = 8443;

pub const DEFAULT_HELLO_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_NEGOTIATING_HELLO_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_HOLD_TIME_SECS: u64 = 30;
pub const DEFAULT_NEGOTIATION_SECS: u64 = 25;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_DRIFT_WARNING_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_FACTOR: u32 = 32;
pub const DEFAULT_CLUSTER_CHANNEL: &str = "clustering";
pub const DEFAULT_AUTO_SNAPSHOT_WINDOW_SECS: u64 = 600;

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: NetwardenConfig) -> NetwardenConfig {
    let config = apply_logging_defaults(config);
    let config = apply_task_defaults(config);
    apply_cluster_defaults(config)
}

fn apply_logging_defaults(mut config: NetwardenConfig) -> NetwardenConfig {
    if config.logging.level.trim().is_empty() {
        config.logging.level = DEFAULT_LOG_LEVEL.to_string();
    }
    config
}

fn apply_task_defaults(mut config: NetwardenConfig) -> NetwardenConfig {
    if config.tasks.thread_count == 0 {
        config.tasks.thread_count = DEFAULT_THREAD_COUNT;
    }
    config
}

/// Out-of-range cluster knobs fall back to their defaults.
fn apply_cluster_defaults(mut config: NetwardenConfig) -> NetwardenConfig {
    let cluster = &mut config.cluster;
    if !(MIN_RUNNER_WEIGHT..=MAX_RUNNER_WEIGHT).contains(&cluster.runner_weight) {
        error!(
            runner_weight = cluster.runner_weight,
            "Invalid value for runner weight, will use {} by default", DEFAULT_RUNNER_WEIGHT
        );
        cluster.runner_weight = DEFAULT_RUNNER_WEIGHT;
    }
    if cluster.hello_interval_secs == 0 {
        cluster.hello_interval_secs = DEFAULT_HELLO_INTERVAL_SECS;
    }
    if cluster.receive_timeout_ms == 0 {
        cluster.receive_timeout_ms = DEFAULT_RECEIVE_TIMEOUT_MS;
    }
    if cluster.reconnect_max_factor == 0 {
        cluster.reconnect_max_factor = DEFAULT_RECONNECT_MAX_FACTOR;
    }
    if cluster.channel.trim().is_empty() {
        cluster.channel = DEFAULT_CLUSTER_CHANNEL.to_string();
    }
    config
}
