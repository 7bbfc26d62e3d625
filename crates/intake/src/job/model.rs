use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{normalize_batch_size, MAX_LOG_LINES};

/// Job lifecycle state machine.
///
/// `uploading -> checking -> (awaiting_confirmation | ready) -> importing -> (done | error)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploading,
    Checking,
    AwaitingConfirmation,
    Ready,
    Importing,
    Done,
    Error,
}

impl JobStatus {
    /// The worker owns the record once it starts; recomputation must not
    /// move the job out of these states.
    pub fn is_worker_owned(&self) -> bool {
        matches!(self, JobStatus::Importing | JobStatus::Done | JobStatus::Error)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Job-level compatibility summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatStatus {
    Pending,
    Checking,
    Compatible,
    Incompatible,
    Error,
}

/// Per-file lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Uploaded,
    Imported,
    Skipped,
    Error,
}

/// Per-file compatibility verdict, independent of `EntryStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compat {
    Compatible,
    Incompatible,
    Error,
}

/// Special upload workflows that change how some files are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialUpload {
    /// SEM-EDX spectra: `.txt` files attach to a sibling image instead
    /// of being imported.
    SemEdxSpectra,
}

/// Connection details for the backing store, supplied at job creation
/// and passed through unmodified to CLI invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSession {
    pub key: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl StoreSession {
    pub fn is_complete(&self) -> bool {
        self.key.is_some() && self.host.is_some() && self.port.is_some()
    }
}

/// One file within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub upload_id: String,
    pub relative_path: String,
    pub staged_path: PathBuf,
    pub size: u64,
    pub status: EntryStatus,
    #[serde(default)]
    pub compatibility: Option<Compat>,
    #[serde(default)]
    pub compatibility_skip: bool,
    #[serde(default)]
    pub import_skip: bool,
    /// Relative path of the entry this sidecar attaches to, if any.
    #[serde(default)]
    pub attach_to: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl FileEntry {
    /// Counts toward `uploaded_bytes` once the bytes are on disk,
    /// whatever happens afterwards.
    pub fn counts_as_uploaded(&self) -> bool {
        matches!(
            self.status,
            EntryStatus::Uploaded | EntryStatus::Imported | EntryStatus::Skipped
        )
    }

    /// Eligible for a compatibility probe.
    pub fn needs_compatibility_check(&self) -> bool {
        self.status == EntryStatus::Uploaded
            && self.compatibility.is_none()
            && !self.compatibility_skip
    }

    /// Eligible for the import pass.
    pub fn is_importable(&self) -> bool {
        matches!(self.status, EntryStatus::Uploaded)
            && !self.import_skip
            && self.compatibility != Some(Compat::Incompatible)
    }
}

/// One upload-and-import session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub owner: String,
    pub session: StoreSession,
    #[serde(default)]
    pub target_container_id: Option<String>,
    #[serde(default)]
    pub special_upload: Option<SpecialUpload>,
    pub batch_size: usize,
    pub files: Vec<FileEntry>,
    pub status: JobStatus,
    pub compatibility_status: CompatStatus,
    #[serde(default)]
    pub compatibility_confirmed: bool,
    /// One compatibility sweep at a time; set under the record lock.
    #[serde(default)]
    pub compatibility_check_active: bool,
    /// The import worker starts at most once; set under the record lock.
    #[serde(default)]
    pub import_started: bool,
    #[serde(default)]
    pub incompatible_paths: Vec<String>,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub imported_bytes: u64,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn new_upload_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Job {
    pub fn new(
        owner: impl Into<String>,
        session: StoreSession,
        target_container_id: Option<String>,
        batch_size: Option<usize>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: new_job_id(),
            owner: owner.into(),
            session,
            target_container_id,
            special_upload: None,
            batch_size: normalize_batch_size(batch_size),
            files: Vec::new(),
            status: JobStatus::Uploading,
            compatibility_status: CompatStatus::Pending,
            compatibility_confirmed: false,
            compatibility_check_active: false,
            import_started: false,
            incompatible_paths: Vec::new(),
            total_bytes: 0,
            uploaded_bytes: 0,
            imported_bytes: 0,
            messages: Vec::new(),
            errors: Vec::new(),
            created: now,
            updated: now,
        }
    }

    pub fn entry(&self, relative_path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|e| e.relative_path == relative_path)
    }

    pub fn entry_mut(&mut self, relative_path: &str) -> Option<&mut FileEntry> {
        self.files
            .iter_mut()
            .find(|e| e.relative_path == relative_path)
    }

    pub fn push_message(&mut self, message: impl Into<String>) {
        push_capped(&mut self.messages, message.into());
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        push_capped(&mut self.errors, error.into());
    }

    pub fn record_incompatible(&mut self, relative_path: &str) {
        if !self.incompatible_paths.iter().any(|p| p == relative_path) {
            self.incompatible_paths.push(relative_path.to_string());
        }
    }

    pub fn has_pending_uploads(&self) -> bool {
        self.files.iter().any(|e| e.status == EntryStatus::Pending)
    }

    /// Entries the prober still has to classify.
    pub fn compatibility_pending(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|e| e.needs_compatibility_check())
    }

    /// A sweep should be scheduled when classification work exists and
    /// neither a sweep nor the import worker is already running.
    pub fn should_start_compatibility_check(&self) -> bool {
        !self.compatibility_check_active
            && !self.import_started
            && self.compatibility_pending().next().is_some()
    }

    /// Sum of sizes of entries whose bytes made it to disk.
    pub fn recompute_uploaded_bytes(&mut self) {
        self.uploaded_bytes = self
            .files
            .iter()
            .filter(|e| e.counts_as_uploaded())
            .map(|e| e.size)
            .sum();
    }

    pub fn recompute_total_bytes(&mut self) {
        self.total_bytes = self.files.iter().map(|e| e.size).sum();
    }

    /// Recomputes the job-level compatibility summary from per-entry
    /// verdicts. Incompatible wins over error; unfinished work keeps
    /// the summary at checking/pending.
    pub fn recompute_compatibility(&mut self) {
        let any_incompatible = self
            .files
            .iter()
            .any(|e| e.compatibility == Some(Compat::Incompatible));
        let any_error = self
            .files
            .iter()
            .any(|e| e.compatibility == Some(Compat::Error));
        let work_remains =
            self.compatibility_pending().next().is_some() || self.has_pending_uploads();

        self.compatibility_status = if any_incompatible {
            CompatStatus::Incompatible
        } else if work_remains {
            if self.compatibility_check_active {
                CompatStatus::Checking
            } else {
                CompatStatus::Pending
            }
        } else if any_error {
            CompatStatus::Error
        } else {
            CompatStatus::Compatible
        };
    }

    /// Recomputes `status` from the record. Worker-owned states are
    /// never touched; a job leaves them only through the worker.
    pub fn refresh_status(&mut self) {
        if self.status.is_worker_owned() {
            return;
        }
        if self.has_pending_uploads() {
            self.status = JobStatus::Uploading;
            return;
        }
        let any_incompatible = self
            .files
            .iter()
            .any(|e| e.compatibility == Some(Compat::Incompatible));
        if any_incompatible && !self.compatibility_confirmed {
            self.status = JobStatus::AwaitingConfirmation;
            return;
        }
        // A per-entry probe error does not block import; the entry is
        // attempted anyway and fails or succeeds on its own.
        if self.compatibility_pending().next().is_some() || self.compatibility_check_active {
            self.status = JobStatus::Checking;
        } else {
            self.status = JobStatus::Ready;
        }
    }
}

fn push_capped(log: &mut Vec<String>, line: String) {
    log.push(line);
    if log.len() > MAX_LOG_LINES {
        let excess = log.len() - MAX_LOG_LINES;
        log.drain(..excess);
    }
}
