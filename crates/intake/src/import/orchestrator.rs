use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use futures_util::StreamExt;

use crate::context::IntakeContext;
use crate::error::{ImportError, Result};
use crate::import::attachments::run_attachment_pass;
use crate::job::model::{Compat, EntryStatus, Job, JobStatus};
use crate::job::store::JobStore;
use crate::store::adapter::DataStore;
use crate::store::cli::{CliOutput, StoreCli};

/// Phrases on stderr that turn an exit-0 import into a failure.
const FAILURE_MARKERS: &[&str] = &["error", "exception", "failed"];

/// Background import worker, at most one per job, guarded by the
/// per-user lock so a single owner never runs two imports at once.
#[derive(Clone)]
pub struct ImportWorker {
    ctx: Arc<IntakeContext>,
    store: JobStore,
    cli: StoreCli,
}

impl ImportWorker {
    pub fn new(ctx: Arc<IntakeContext>, store: JobStore, cli: StoreCli) -> Self {
        Self { ctx, store, cli }
    }

    /// Sets the started flag under the record lock and spawns the
    /// worker. Returns `None` when the job is not `ready` or a worker
    /// was already started.
    pub fn maybe_start(
        &self,
        job_id: &str,
        datastore: Arc<dyn DataStore>,
    ) -> Result<Option<JoinHandle<()>>> {
        let mut claimed = false;
        self.store.update(job_id, |job| {
            if job.status == JobStatus::Ready && !job.import_started {
                job.import_started = true;
                claimed = true;
            }
        })?;
        if !claimed {
            return Ok(None);
        }

        let worker = self.clone();
        let job_id = job_id.to_string();
        let handle = std::thread::spawn(move || {
            let span = tracing::info_span!("import_worker", job_id = %job_id);
            let _guard = span.enter();
            worker.run(&job_id, datastore);
        });
        Ok(Some(handle))
    }

    fn run(&self, job_id: &str, datastore: Arc<dyn DataStore>) {
        let job = match self.store.load(job_id) {
            Ok(job) => job,
            Err(e) => {
                log::warn!("Import worker exiting, cannot load {}: {}", job_id, e);
                return;
            }
        };

        let Some(_lock) = self
            .ctx
            .import_locks
            .acquire(&job.owner, self.ctx.config.user_lock_timeout)
        else {
            log::error!(
                "Import lock timeout for user {} on job {}",
                job.owner,
                job_id
            );
            self.fail_job(
                job_id,
                ImportError::UserLockTimeout {
                    user: job.owner.clone(),
                }
                .to_string(),
            );
            return;
        };

        if !job.session.is_complete() {
            self.fail_job(job_id, ImportError::MissingConnection.to_string());
            return;
        }
        let staging_dir = self.store.staging_dir(job_id);
        if !staging_dir.is_dir() {
            self.fail_job(job_id, ImportError::StagingMissing(staging_dir).to_string());
            return;
        }

        if self.store.update(job_id, mark_importing).is_err() {
            log::error!("Could not mark job {} importing", job_id);
            return;
        }

        self.skip_pass(job_id);

        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                self.fail_job(job_id, format!("Import runtime unavailable: {e}"));
                return;
            }
        };

        loop {
            let job = match self.store.load(job_id) {
                Ok(job) => job,
                Err(e) => {
                    log::warn!("Import worker stopping for {}: {}", job_id, e);
                    return;
                }
            };
            let batch = importable_batch(&job);
            if batch.is_empty() {
                break;
            }

            log::info!("Importing batch of {} file(s) for job {}", batch.len(), job_id);
            let session = job.session.clone();
            let container = job.target_container_id.clone();
            let timeout = self.ctx.config.import_timeout;
            let cli = &self.cli;
            let concurrency = batch.len();

            let results: Vec<(String, u64, PathBuf, CliOutput)> = rt.block_on(async {
                futures_util::stream::iter(batch.into_iter().map(
                    |(path, size, staged)| {
                        let session = session.clone();
                        let container = container.clone();
                        async move {
                            let output = cli
                                .import(&session, container.as_deref(), &staged, timeout)
                                .await;
                            (path, size, staged, output)
                        }
                    },
                ))
                .buffer_unordered(concurrency)
                .collect()
                .await
            });

            let mut applied: Vec<(String, u64, std::result::Result<(), String>)> = Vec::new();
            for (path, size, staged, output) in results {
                if import_succeeded(&output) {
                    if let Err(e) = std::fs::remove_file(&staged) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("Could not remove staged file {:?}: {}", staged, e);
                        }
                    }
                    applied.push((path, size, Ok(())));
                } else {
                    applied.push((path, size, Err(failure_detail(&output))));
                }
            }

            let update = self.store.update(job_id, |job| {
                for (path, size, result) in &applied {
                    let Some(entry) = job.entry_mut(path) else {
                        continue;
                    };
                    if entry.status != EntryStatus::Uploaded {
                        continue;
                    }
                    match result {
                        Ok(()) => {
                            entry.status = EntryStatus::Imported;
                            job.push_message(format!("Import success: {path}"));
                        }
                        Err(detail) => {
                            entry.status = EntryStatus::Error;
                            entry.errors.push(detail.clone());
                            job.push_error(format!("Import failure: {path}"));
                        }
                    }
                    // Failed attempts still count as processed so the
                    // progress counter never stalls on a bad file.
                    job.imported_bytes += size;
                }
            });
            if let Err(e) = update {
                log::error!("Could not apply import batch for {}: {}", job_id, e);
                return;
            }
        }

        if let Err(e) = run_attachment_pass(&self.store, job_id, datastore.as_ref()) {
            log::error!("Attachment pass failed for {}: {}", job_id, e);
        }

        let finished = self.store.update(job_id, |job| {
            job.status = if job.errors.is_empty() {
                JobStatus::Done
            } else {
                JobStatus::Error
            };
        });
        match finished {
            Ok(job) => log::info!("Import finished for {}: {:?}", job_id, job.status),
            Err(e) => log::error!("Could not finalize job {}: {}", job_id, e),
        }
    }

    /// Converts skip-flagged and incompatible entries to `skipped`,
    /// crediting their bytes, before any import runs.
    fn skip_pass(&self, job_id: &str) {
        let result = self.store.update(job_id, |job| {
            let skips: Vec<(String, u64, bool)> = job
                .files
                .iter()
                .filter(|e| e.status == EntryStatus::Uploaded && e.attach_to.is_none())
                .filter_map(|e| {
                    let incompatible = e.compatibility == Some(Compat::Incompatible);
                    (e.import_skip || incompatible).then(|| {
                        (e.relative_path.clone(), e.size, incompatible)
                    })
                })
                .collect();
            for (path, size, incompatible) in skips {
                if let Some(entry) = job.entry_mut(&path) {
                    entry.status = EntryStatus::Skipped;
                }
                let note = if incompatible {
                    format!("Auto-skipped (incompatible format): {path}")
                } else {
                    format!("Auto-skipped (not an importable image): {path}")
                };
                job.push_message(note);
                job.imported_bytes += size;
            }
        });
        if let Err(e) = result {
            log::error!("Skip pass failed for {}: {}", job_id, e);
        }
    }

    fn fail_job(&self, job_id: &str, reason: String) {
        let result = self.store.update(job_id, |job| {
            job.push_error(reason.clone());
            job.status = JobStatus::Error;
        });
        if let Err(e) = result {
            log::error!("Could not record failure for {}: {}", job_id, e);
        }
    }
}

fn mark_importing(job: &mut Job) {
    job.status = JobStatus::Importing;
}

fn importable_batch(job: &Job) -> Vec<(String, u64, PathBuf)> {
    job.files
        .iter()
        .filter(|e| {
            e.status == EntryStatus::Uploaded
                && e.attach_to.is_none()
                && !e.import_skip
                && e.compatibility != Some(Compat::Incompatible)
        })
        .take(job.batch_size)
        .map(|e| (e.relative_path.clone(), e.size, e.staged_path.clone()))
        .collect()
}

fn import_succeeded(output: &CliOutput) -> bool {
    if !output.success || output.timed_out {
        return false;
    }
    let stderr = output.stderr.to_lowercase();
    !FAILURE_MARKERS.iter().any(|m| stderr.contains(m))
}

fn failure_detail(output: &CliOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        "Import failed".to_string()
    } else {
        stderr.lines().next().unwrap_or("Import failed").to_string()
    }
}
