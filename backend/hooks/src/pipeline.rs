/// Post-job hook pipeline.
///
/// The pipeline is what the job runner calls once a terminal job state is
/// persisted. Every matching hook runs in registration order; a failing hook is
/// logged and the chain continues.
use tracing::{debug, warn};

use crate::registry::HookRegistry;
use crate::types::PostJobPayload;

/// What happened when one hook ran.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub hook: String,
    pub result: Result<String, String>,
}

#[derive(Clone, Default)]
pub struct HookPipeline {
    pub registry: HookRegistry,
}

impl HookPipeline {
    pub fn new(registry: HookRegistry) -> Self {
        Self { registry }
    }

    /// Run every enabled hook registered for the payload's job type.
    pub async fn after_job(&self, payload: &PostJobPayload) -> Vec<HookOutcome> {
        let hooks = self.registry.matching(&payload.job_type).await;
        let mut outcomes = Vec::with_capacity(hooks.len());
        for hook in hooks {
            debug!(
                "[Hooks] Running {} for {}_{}",
                hook.name(),
                payload.job_type,
                payload.job_id
            );
            let result = match hook.execute(payload).await {
                Ok(line) => {
                    debug!("[Hooks] {} returned: {}", hook.name(), line);
                    Ok(line)
                }
                Err(e) => {
                    warn!("[Hooks] {} returned error: {}", hook.name(), e);
                    Err(e.to_string())
                }
            };
            outcomes.push(HookOutcome { hook: hook.name().to_string(), result });
        }
        outcomes
    }
}
