pub mod error;
pub mod shutdown;

pub use error::NetwardenError;
pub use shutdown::{Shutdown, ShutdownTrigger};
