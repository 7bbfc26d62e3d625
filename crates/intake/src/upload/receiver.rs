use std::collections::HashSet;
use std::path::Path;

use crate::error::{IntakeError, Result, UploadError};
use crate::job::model::{EntryStatus, Job, JobStatus};
use crate::job::store::JobStore;

/// One file's bytes within a submit request.
pub struct ChunkUpload {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

/// Result of one submit request, taken from the record after all
/// entries in the request were applied under a single update.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub ready: bool,
    pub job: Job,
}

/// Accepts uploaded chunks and applies their outcomes to the job.
pub struct UploadReceiver {
    store: JobStore,
}

enum WriteResult {
    Written,
    Failed(String),
}

impl UploadReceiver {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    /// Writes each chunk to its entry's staged location, then folds all
    /// outcomes into one job update. A write failure marks that entry
    /// `error` without aborting its siblings.
    pub fn submit(&self, job_id: &str, chunks: Vec<ChunkUpload>) -> Result<SubmitOutcome> {
        let job = self.store.load(job_id)?;

        let mut rejected = Vec::new();
        let mut outcomes: Vec<(String, WriteResult)> = Vec::new();

        for chunk in chunks {
            let Some(entry) = job.entry(&chunk.relative_path) else {
                rejected.push(chunk.relative_path);
                continue;
            };
            if !matches!(entry.status, EntryStatus::Pending | EntryStatus::Error) {
                rejected.push(chunk.relative_path);
                continue;
            }

            let result = match write_staged(&entry.staged_path, &chunk.bytes) {
                Ok(()) => WriteResult::Written,
                Err(e) => {
                    log::warn!(
                        "Staging write failed for {} in job {}: {}",
                        chunk.relative_path,
                        job_id,
                        e
                    );
                    WriteResult::Failed(e.to_string())
                }
            };
            outcomes.push((chunk.relative_path, result));
        }

        if outcomes.is_empty() {
            if rejected.is_empty() {
                return Err(UploadError::NoFiles.into());
            }
            return Err(UploadError::PayloadMismatch.into());
        }

        let mut accepted = Vec::new();
        let job = self.store.update(job_id, |job| {
            for (path, result) in &outcomes {
                let Some(entry) = job.entry_mut(path) else {
                    continue;
                };
                match result {
                    WriteResult::Written => {
                        entry.status = EntryStatus::Uploaded;
                        entry.errors.clear();
                    }
                    WriteResult::Failed(reason) => {
                        entry.status = EntryStatus::Error;
                        entry.errors.push(reason.clone());
                        job.push_error(format!("Failed to stage {path}: {reason}"));
                    }
                }
            }
            job.recompute_uploaded_bytes();
            job.refresh_status();
            job.recompute_compatibility();
        })?;

        for (path, result) in outcomes {
            if matches!(result, WriteResult::Written) {
                accepted.push(path);
            }
        }

        Ok(SubmitOutcome {
            accepted,
            rejected,
            uploaded_bytes: job.uploaded_bytes,
            total_bytes: job.total_bytes,
            ready: job.status == JobStatus::Ready,
            job,
        })
    }

    /// Drops every entry not named in `keep_paths`, deletes its staged
    /// bytes, and recomputes counters and the compatibility summary.
    pub fn prune(&self, job_id: &str, keep_paths: &[String]) -> Result<Job> {
        let keep: HashSet<&str> = keep_paths.iter().map(String::as_str).collect();
        let job = self.store.load(job_id)?;

        for entry in job
            .files
            .iter()
            .filter(|e| !keep.contains(e.relative_path.as_str()))
        {
            // Remove the whole per-upload directory, not just the file.
            let target = entry
                .staged_path
                .parent()
                .unwrap_or(entry.staged_path.as_path());
            if let Err(e) = std::fs::remove_dir_all(target) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Could not remove staged payload {:?}: {}", target, e);
                }
            }
        }

        let job = self.store.update(job_id, |job| {
            job.files.retain(|e| keep.contains(e.relative_path.as_str()));
            let kept: HashSet<String> =
                job.files.iter().map(|e| e.relative_path.clone()).collect();
            job.incompatible_paths.retain(|p| kept.contains(p));
            job.recompute_total_bytes();
            job.recompute_uploaded_bytes();
            job.refresh_status();
            job.recompute_compatibility();
        })?;
        Ok(job)
    }
}

fn write_staged(staged_path: &Path, bytes: &[u8]) -> std::result::Result<(), IntakeError> {
    if let Some(parent) = staged_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| UploadError::CreateDirectory {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(staged_path, bytes).map_err(|e| UploadError::WriteStaged {
        path: staged_path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}
