use std::time::Duration;

use netwarden_config::ClusterConfig;

use crate::identity::{local_hostname, resolve_instance_id};

/// Resolved coordinator settings. Durations rather than raw config numbers so
/// tests can run the protocol on millisecond timescales.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub instance_id: String,
    pub hostname: String,
    pub app_version: String,
    pub driver_hash: String,
    pub master_priority: i32,
    pub runner_priority: i32,
    pub runner_weight: i32,
    pub channel: String,
    pub hello_interval: Duration,
    pub negotiating_hello_interval: Duration,
    pub hold_time: Duration,
    pub negotiation: Duration,
    pub receive_timeout: Duration,
    pub drift_warning: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_factor: u32,
    pub auto_snapshot_window: Duration,
}

impl ClusterSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            instance_id: resolve_instance_id(config.id.as_deref(), config.service_port),
            hostname: local_hostname(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            driver_hash: String::new(),
            master_priority: config.master_priority,
            runner_priority: config.runner_priority,
            runner_weight: config.runner_weight,
            channel: config.channel.clone(),
            hello_interval: Duration::from_secs(config.hello_interval_secs),
            negotiating_hello_interval: Duration::from_secs(config.negotiating_hello_interval_secs),
            hold_time: Duration::from_secs(config.hold_time_secs),
            negotiation: Duration::from_secs(config.negotiation_secs),
            receive_timeout: Duration::from_millis(config.receive_timeout_ms),
            drift_warning: Duration::from_secs(config.drift_warning_secs),
            reconnect_base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            reconnect_max_factor: config.reconnect_max_factor,
            auto_snapshot_window: Duration::from_secs(config.auto_snapshot_window_secs),
        }
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_driver_hash(mut self, hash: impl Into<String>) -> Self {
        self.driver_hash = hash.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_config() {
        let settings = ClusterSettings::from_config(&ClusterConfig::default())
            .with_instance_id("aaaaaaaaaaaaaaaaaaaa");
        assert_eq!(settings.instance_id, "aaaaaaaaaaaaaaaaaaaa");
        assert_eq!(settings.hello_interval, Duration::from_secs(10));
        assert_eq!(settings.reconnect_base_delay, Duration::from_millis(500));
        assert_eq!(settings.reconnect_max_factor, 32);
        assert_eq!(settings.channel, "clustering");
        assert_eq!(settings.hold_time, Duration::from_secs(30));
    }
}
