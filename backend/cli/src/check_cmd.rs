//! `netwarden check`: validate a config file without starting anything.

use std::path::Path;

use anyhow::{bail, Context, Result};

use netwarden_config::{load_raw_config, resolve_env_vars, validate, NetwardenConfig};

use crate::terminal_output::{note_error, note_success, note_warn};

pub async fn run(path: &Path) -> Result<()> {
    let raw = load_raw_config(path).await?;
    let resolved = resolve_env_vars(&raw).context("failed to resolve env vars in config")?;
    let config: NetwardenConfig =
        serde_json::from_value(resolved).context("config does not match the expected schema")?;

    let report = validate(&config);
    for warning in &report.warnings {
        note_warn(&format!("{}: {}", warning.path, warning.message));
    }
    for error in &report.errors {
        note_error(&format!("{}: {}", error.path, error.message));
    }

    if !report.is_valid() {
        bail!("{} has {} error(s)", path.display(), report.errors.len());
    }
    note_success(&format!("{} is valid", path.display()));
    Ok(())
}
