/// Hook trait and registry.
///
/// Hooks are registered against one or more job type names. Only enabled hooks
/// whose type list contains the finished job's type are returned by `matching`.
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::PostJobPayload;

// ---------------------------------------------------------------------------
// Hook trait
// ---------------------------------------------------------------------------

/// A side effect run after a job completes.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Run the hook and return a short result line for the logs.
    async fn execute(&self, payload: &PostJobPayload) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct HookEntry {
    hook: Arc<dyn Hook>,
    job_types: Vec<String>,
    enabled: bool,
}

/// Thread-safe registry of post-job hooks.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Arc<RwLock<Vec<HookEntry>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enabled hook for the given job types.
    pub async fn register<I, S>(&self, hook: Arc<dyn Hook>, job_types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut hooks = self.hooks.write().await;
        hooks.push(HookEntry {
            hook,
            job_types: job_types.into_iter().map(Into::into).collect(),
            enabled: true,
        });
    }

    /// Enable or disable every hook with this name. Returns how many were touched.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> usize {
        let mut hooks = self.hooks.write().await;
        let mut count = 0;
        for entry in hooks.iter_mut().filter(|e| e.hook.name() == name) {
            entry.enabled = enabled;
            count += 1;
        }
        count
    }

    /// Enabled hooks interested in `job_type`, in registration order.
    pub async fn matching(&self, job_type: &str) -> Vec<Arc<dyn Hook>> {
        let hooks = self.hooks.read().await;
        hooks
            .iter()
            .filter(|e| e.enabled && e.job_types.iter().any(|t| t == job_type))
            .map(|e| e.hook.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.hooks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hooks.read().await.is_empty()
    }
}
