pub mod classify;
pub mod sweeper;

pub use classify::{classify, has_import_candidates, Verdict};
pub use sweeper::{CompatibilitySweeper, ReadyHandoff};
