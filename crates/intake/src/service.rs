use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cleanup::CleanupSweeper;
use crate::config::MAX_BATCH_BYTES;
use crate::context::IntakeContext;
use crate::error::{Result, UploadError};
use crate::import::orchestrator::ImportWorker;
use crate::job::model::{
    new_upload_id, Compat, CompatStatus, EntryStatus, FileEntry, Job, JobStatus, SpecialUpload,
    StoreSession,
};
use crate::job::store::JobStore;
use crate::probe::sweeper::{CompatibilitySweeper, ReadyHandoff};
use crate::store::adapter::DataStore;
use crate::store::cli::StoreCli;
use crate::upload::paths::{
    is_sidecar, safe_relative_path, should_auto_skip, sidecar_target, staged_location,
};
use crate::upload::receiver::{ChunkUpload, SubmitOutcome, UploadReceiver};

/// One declared file in a start-job request.
#[derive(Debug, Clone, Deserialize)]
pub struct FileDecl {
    pub relative_path: String,
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartJobRequest {
    pub owner: String,
    pub session: StoreSession,
    #[serde(default)]
    pub target_container_id: Option<String>,
    #[serde(default)]
    pub special_upload: Option<SpecialUpload>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    pub files: Vec<FileDecl>,
}

#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
    pub total_bytes: u64,
    pub auto_skipped: Vec<String>,
}

/// Polling view of one job, serialized for the client.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub compatibility_status: CompatStatus,
    pub compatibility_confirmed: bool,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub imported_bytes: u64,
    pub incompatible_paths: Vec<String>,
    pub files: Vec<FileSummary>,
    pub messages: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub relative_path: String,
    pub status: EntryStatus,
    pub compatibility: Option<Compat>,
    pub size: u64,
}

/// Inbound surface for the excluded web layer: start a job, push
/// chunks, confirm past incompatibilities, prune, poll status.
///
/// Every entry point opportunistically triggers a cleanup sweep; the
/// throttle keeps that cheap.
pub struct UploadService {
    ctx: Arc<IntakeContext>,
    store: JobStore,
    receiver: UploadReceiver,
    prober: CompatibilitySweeper,
    importer: ImportWorker,
    cleaner: CleanupSweeper,
    datastore: Arc<dyn DataStore>,
}

impl UploadService {
    pub fn new(ctx: Arc<IntakeContext>, datastore: Arc<dyn DataStore>) -> Self {
        let store = JobStore::new(&ctx.config.staging_root);
        let cli = StoreCli::new(&ctx.config.cli_path);
        Self {
            receiver: UploadReceiver::new(store.clone()),
            prober: CompatibilitySweeper::new(Arc::clone(&ctx), store.clone(), cli.clone()),
            importer: ImportWorker::new(Arc::clone(&ctx), store.clone(), cli),
            cleaner: CleanupSweeper::new(Arc::clone(&ctx), store.clone()),
            ctx,
            store,
            datastore,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn context(&self) -> &IntakeContext {
        &self.ctx
    }

    /// Creates a job with one pending entry per declared file.
    pub fn start_job(&self, request: StartJobRequest) -> Result<StartJobResponse> {
        self.cleaner.sweep();

        if request.files.is_empty() {
            return Err(UploadError::NoFiles.into());
        }

        let mut invalid = Vec::new();
        let mut paths = Vec::with_capacity(request.files.len());
        for decl in &request.files {
            match safe_relative_path(&decl.relative_path) {
                Ok(path) => paths.push(path),
                Err(_) => invalid.push(decl.relative_path.clone()),
            }
        }
        if !invalid.is_empty() {
            return Err(UploadError::InvalidPath(invalid.join(", ")).into());
        }

        let total: u64 = request.files.iter().map(|d| d.size.max(0) as u64).sum();
        if total > MAX_BATCH_BYTES {
            return Err(UploadError::BatchTooLarge {
                max_gb: crate::config::MAX_BATCH_GB,
            }
            .into());
        }

        let mut job = Job::new(
            request.owner,
            request.session,
            request.target_container_id,
            request.batch_size,
        );
        job.special_upload = request.special_upload;
        let staging_dir = self.store.staging_dir(&job.job_id);
        let spectra_mode = request.special_upload == Some(SpecialUpload::SemEdxSpectra);
        let mut auto_skipped = Vec::new();

        for (decl, path) in request.files.iter().zip(&paths) {
            let upload_id = new_upload_id();
            let junk = should_auto_skip(path);
            let attach_to = if spectra_mode && is_sidecar(path) {
                sidecar_target(path, paths.iter().map(String::as_str))
            } else {
                None
            };
            if junk {
                auto_skipped.push(path.clone());
            }
            job.files.push(FileEntry {
                staged_path: staged_location(&staging_dir, &upload_id, path),
                upload_id,
                relative_path: path.clone(),
                size: decl.size.max(0) as u64,
                status: EntryStatus::Pending,
                compatibility: None,
                compatibility_skip: junk || attach_to.is_some(),
                import_skip: junk || attach_to.is_some(),
                attach_to,
                errors: Vec::new(),
            });
        }
        job.recompute_total_bytes();

        std::fs::create_dir_all(&staging_dir).map_err(|e| UploadError::CreateDirectory {
            path: staging_dir.clone(),
            source: e,
        })?;
        self.store.create(&job)?;
        log::info!(
            "Started upload job {} for {} with {} file(s)",
            job.job_id,
            job.owner,
            job.files.len()
        );
        Ok(StartJobResponse {
            job_id: job.job_id,
            total_bytes: job.total_bytes,
            auto_skipped,
        })
    }

    /// Stages a batch of chunks, then schedules whatever follow-up the
    /// new record state calls for.
    pub fn submit_chunk(&self, job_id: &str, chunks: Vec<ChunkUpload>) -> Result<SubmitOutcome> {
        self.cleaner.sweep();

        let outcome = self.receiver.submit(job_id, chunks)?;
        if outcome.job.should_start_compatibility_check() {
            self.prober
                .maybe_start(job_id, Some(self.ready_handoff()))?;
        } else if outcome.ready {
            self.start_import(job_id);
        }
        Ok(outcome)
    }

    /// Operator accepts the incompatible files; the compatible
    /// remainder proceeds to import.
    pub fn confirm(&self, job_id: &str) -> Result<JobSummary> {
        self.cleaner.sweep();

        let job = self.store.update(job_id, |job| {
            if job.status == JobStatus::AwaitingConfirmation {
                job.compatibility_confirmed = true;
                job.refresh_status();
            }
        })?;
        if job.status == JobStatus::Ready {
            self.start_import(job_id);
        }
        Ok(summarize(&self.store.load(job_id)?))
    }

    /// Withdraws every file not named in `keep_paths`. Dropping the
    /// last blocker can leave the job `ready`, so the same follow-up
    /// scheduling as submit applies.
    pub fn prune(&self, job_id: &str, keep_paths: &[String]) -> Result<JobSummary> {
        self.cleaner.sweep();
        let job = self.receiver.prune(job_id, keep_paths)?;
        if job.should_start_compatibility_check() {
            self.prober
                .maybe_start(job_id, Some(self.ready_handoff()))?;
        } else if job.status == JobStatus::Ready {
            self.start_import(job_id);
        }
        Ok(summarize(&job))
    }

    pub fn status(&self, job_id: &str) -> Result<JobSummary> {
        self.cleaner.sweep();
        Ok(summarize(&self.store.load(job_id)?))
    }

    fn start_import(&self, job_id: &str) {
        match self
            .importer
            .maybe_start(job_id, Arc::clone(&self.datastore))
        {
            Ok(Some(_)) => log::info!("Import worker started for {}", job_id),
            Ok(None) => {}
            Err(e) => log::error!("Could not start import for {}: {}", job_id, e),
        }
    }

    fn ready_handoff(&self) -> ReadyHandoff {
        let importer = self.importer.clone();
        let datastore = Arc::clone(&self.datastore);
        Arc::new(move |job_id: &str| {
            match importer.maybe_start(job_id, Arc::clone(&datastore)) {
                Ok(Some(_)) => log::info!("Import worker started for {}", job_id),
                Ok(None) => {}
                Err(e) => log::error!("Could not start import for {}: {}", job_id, e),
            }
        })
    }
}

fn summarize(job: &Job) -> JobSummary {
    JobSummary {
        job_id: job.job_id.clone(),
        status: job.status,
        compatibility_status: job.compatibility_status,
        compatibility_confirmed: job.compatibility_confirmed,
        total_bytes: job.total_bytes,
        uploaded_bytes: job.uploaded_bytes,
        imported_bytes: job.imported_bytes,
        incompatible_paths: job.incompatible_paths.clone(),
        files: job
            .files
            .iter()
            .map(|e| FileSummary {
                relative_path: e.relative_path.clone(),
                status: e.status,
                compatibility: e.compatibility,
                size: e.size,
            })
            .collect(),
        messages: job.messages.clone(),
        errors: job.errors.clone(),
    }
}
