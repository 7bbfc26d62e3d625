pub mod model;
pub mod store;

pub use model::{
    Compat, CompatStatus, EntryStatus, FileEntry, Job, JobStatus, SpecialUpload, StoreSession,
};
pub use store::{is_valid_job_id, JobStore};
