pub mod cleanup;
pub mod config;
pub mod context;
pub mod error;
pub mod import;
pub mod job;
pub mod probe;
pub mod service;
pub mod store;
pub mod upload;

pub use cleanup::{CleanupSweeper, SweepThrottle};
pub use config::IntakeConfig;
pub use context::IntakeContext;
pub use error::{CleanupError, ImportError, IntakeError, JobStoreError, Result, UploadError};
pub use import::{ImportLockRegistry, ImportWorker};
pub use job::{Job, JobStatus, JobStore, SpecialUpload, StoreSession};
pub use probe::{classify, CompatibilitySweeper, Verdict};
pub use service::{JobSummary, StartJobRequest, StartJobResponse, UploadService};
pub use store::{CliDataStore, DataStore, NullDataStore, StoreCli};
pub use upload::{ChunkUpload, UploadReceiver};
