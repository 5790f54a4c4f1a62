pub mod builtin;
pub mod pipeline;
pub mod registry;
pub mod types;

pub use builtin::{LoggingHook, WebHook};
pub use pipeline::{HookOutcome, HookPipeline};
pub use registry::{Hook, HookRegistry};
pub use types::{PostJobPayload, WebHookFormat};
