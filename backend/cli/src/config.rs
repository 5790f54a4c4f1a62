use std::path::{Path, PathBuf};

use anyhow::Result;

use netwarden_config::{config_dir, config_file_path, load_and_prepare, NetwardenConfig};

/// Config file to use: the `--config` flag, then `NETWARDEN_CONFIG`, then the
/// default location under the netwarden config directory.
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("NETWARDEN_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| config_file_path(&config_dir()))
}

pub async fn load(path: &Path) -> Result<NetwardenConfig> {
    load_and_prepare(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_takes_precedence() {
        let path = resolve_config_path(Some(PathBuf::from("/tmp/custom.yaml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.yaml"));
    }

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("netwarden-cli-absent-config.yaml");
        let config = load(&path).await.unwrap();
        assert!(!config.cluster.enabled);
        assert_eq!(config.tasks.thread_count, 10);
    }
}
