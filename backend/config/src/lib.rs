//! `netwarden-config`: runtime configuration management.
//!
//! Provides:
//! - Typed config schema (database, logging, tasks, cluster)
//! - YAML loading
//! - `${ENV_VAR}` substitution
//! - Default value normalization
//! - Validation report with config paths

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_raw_config};
pub use schema::{ClusterConfig, DatabaseConfig, LoggingConfig, NetwardenConfig, TasksConfig};
pub use validation::{is_valid_instance_id, validate, ConfigValidationError, ValidationReport};

use anyhow::{Context, Result};
use std::path::Path;

/// Load, apply env substitution, validate and normalize a config file.
///
/// This is the main entry point for loading a config at runtime. A missing
/// file yields the default configuration.
pub async fn load_and_prepare(path: &Path) -> Result<NetwardenConfig> {
    let value = load_raw_config(path).await?;
    let value = resolve_env_vars(&value).context("Failed to resolve env vars in config")?;

    let config: NetwardenConfig =
        serde_json::from_value(value).context("Failed to deserialize config after processing")?;

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }

    Ok(apply_all_defaults(config))
}
