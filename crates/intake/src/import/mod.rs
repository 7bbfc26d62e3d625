pub mod attachments;
pub mod locks;
pub mod orchestrator;

pub use locks::{ImportLockGuard, ImportLockRegistry};
pub use orchestrator::ImportWorker;
