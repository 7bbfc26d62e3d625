use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Job store error: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Cleanup error: {0}")]
    Cleanup(#[from] CleanupError),
}

#[derive(Error, Debug)]
pub enum JobStoreError {
    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job record '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not update job state for '{job_id}': lock contention")]
    LockContended { job_id: String },

    #[error("Failed to read job record '{path}': {source}")]
    ReadRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write job record '{path}': {source}")]
    WriteRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid relative path: {0}")]
    InvalidPath(String),

    #[error("No files provided")]
    NoFiles,

    #[error("Upload batch exceeds the limit of {max_gb} GB")]
    BatchTooLarge { max_gb: u64 },

    #[error("No matching file entries in upload payload")]
    PayloadMismatch,

    #[error("Failed to create staging directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write staged file '{path}': {source}")]
    WriteStaged {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Missing backing store connection details")]
    MissingConnection,

    #[error("Upload folder missing on server: {}", .0.display())]
    StagingMissing(PathBuf),

    #[error("Stuck import detected for user '{user}', restart required")]
    UserLockTimeout { user: String },

    #[error("Image lookup failed: {0}")]
    Lookup(String),

    #[error("Attachment failed for '{path}': {reason}")]
    Attach { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Refusing to delete '{path}': resolves outside the staging root")]
    OutsideRoot { path: PathBuf },

    #[error("Refusing to delete '{path}': symlink in tree")]
    SymlinkInTree { path: PathBuf },

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, IntakeError>;
