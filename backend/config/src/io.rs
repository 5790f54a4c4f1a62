//! Config file location and loading.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default config file name within the config directory.
const CONFIG_FILE_NAME: &str = "netwarden.yaml";

/// Resolve the netwarden config directory.
/// Priority: `NETWARDEN_CONFIG_DIR` env > `~/.netwarden/` > `./.netwarden`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NETWARDEN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".netwarden");
    }
    PathBuf::from(".netwarden")
}

/// Resolve the full path to the main config file.
pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Load the config file as an untyped value tree, ready for env substitution.
///
/// Returns an empty object if the file doesn't exist (first run).
pub async fn load_raw_config(path: &Path) -> Result<Value> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(Value::Object(Default::default()));
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let value: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    // An empty YAML document parses as null.
    Ok(if value.is_null() { Value::Object(Default::default()) } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_empty_object() {
        let path = std::env::temp_dir().join("netwarden-missing-config-test.yaml");
        let value = load_raw_config(&path).await.unwrap();
        assert!(value.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_and_prepares_yaml_file() {
        let path = std::env::temp_dir().join(format!(
            "netwarden-config-test-{}.yaml",
            std::process::id()
        ));
        fs::write(&path, "cluster:\n  enabled: true\n  runnerWeight: 0\ntasks:\n  threadCount: 4\n")
            .await
            .unwrap();

        let config = crate::load_and_prepare(&path).await.unwrap();
        let _ = fs::remove_file(&path).await;

        assert!(config.cluster.enabled);
        assert_eq!(config.tasks.thread_count, 4);
        // out of range, normalized
        assert_eq!(config.cluster.runner_weight, 100);
    }
}
