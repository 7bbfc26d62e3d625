use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use futures_util::StreamExt;

use crate::config::MAX_PROBE_WORKERS;
use crate::context::IntakeContext;
use crate::error::Result;
use crate::job::model::{Compat, EntryStatus, JobStatus};
use crate::job::store::JobStore;
use crate::probe::classify::{classify, Verdict};
use crate::store::cli::StoreCli;

/// Called with the job id when a finished sweep leaves the job `ready`.
pub type ReadyHandoff = Arc<dyn Fn(&str) + Send + Sync>;

/// Background compatibility sweep, one active per job.
///
/// Probes a batch-size prefix of unclassified entries, applies the
/// verdicts in one record update, and reschedules itself until nothing
/// is left, so probing and importing interleave on large jobs.
#[derive(Clone)]
pub struct CompatibilitySweeper {
    ctx: Arc<IntakeContext>,
    store: JobStore,
    cli: StoreCli,
}

impl CompatibilitySweeper {
    pub fn new(ctx: Arc<IntakeContext>, store: JobStore, cli: StoreCli) -> Self {
        Self { ctx, store, cli }
    }

    /// Claims the job's sweep flag under the record lock and spawns the
    /// sweep thread. Returns `None` when another sweep is active, the
    /// import worker has started, or nothing needs classification.
    pub fn maybe_start(
        &self,
        job_id: &str,
        on_ready: Option<ReadyHandoff>,
    ) -> Result<Option<JoinHandle<()>>> {
        let mut claimed = false;
        self.store.update(job_id, |job| {
            if job.should_start_compatibility_check() {
                job.compatibility_check_active = true;
                job.recompute_compatibility();
                claimed = true;
            }
        })?;
        if !claimed {
            return Ok(None);
        }

        let sweeper = self.clone();
        let job_id = job_id.to_string();
        let handle = std::thread::spawn(move || {
            let span = tracing::info_span!("compatibility_sweep", job_id = %job_id);
            let _guard = span.enter();
            sweeper.run(&job_id, on_ready);
        });
        Ok(Some(handle))
    }

    fn run(&self, job_id: &str, on_ready: Option<ReadyHandoff>) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Could not build probe runtime for job {}: {}", job_id, e);
                self.clear_active_flag(job_id);
                return;
            }
        };

        loop {
            let job = match self.store.load(job_id) {
                Ok(job) => job,
                Err(e) => {
                    // Deleted mid-sweep, or the record went bad; stop.
                    log::warn!("Compatibility sweep stopping for {}: {}", job_id, e);
                    return;
                }
            };
            if job.status.is_worker_owned() {
                self.clear_active_flag(job_id);
                return;
            }

            let batch: Vec<(String, PathBuf)> = job
                .compatibility_pending()
                .take(job.batch_size)
                .map(|e| (e.relative_path.clone(), e.staged_path.clone()))
                .collect();
            if batch.is_empty() {
                if self.finish(job_id, on_ready.as_deref()) {
                    // A chunk landed between the load and the finish
                    // transform; this sweep picks it up itself.
                    continue;
                }
                return;
            }

            let workers = batch
                .len()
                .min(MAX_PROBE_WORKERS)
                .min(num_cpus::get().max(1));
            log::info!(
                "Probing {} file(s) for job {} with {} worker(s)",
                batch.len(),
                job_id,
                workers
            );

            let timeout = self.ctx.config.probe_timeout;
            let cli = &self.cli;
            let results: Vec<(String, Verdict, String)> = rt.block_on(async {
                futures_util::stream::iter(batch.into_iter().map(|(path, staged)| async move {
                    let output = cli.probe(&staged, timeout).await;
                    let verdict = classify(&output.stdout, &output.stderr);
                    (path, verdict, first_line(&output.stderr))
                }))
                .buffer_unordered(workers)
                .collect()
                .await
            });

            let applied = self.store.update(job_id, |job| {
                for (path, verdict, detail) in &results {
                    let Some(entry) = job.entry_mut(path) else {
                        continue;
                    };
                    if entry.status != EntryStatus::Uploaded || entry.compatibility.is_some() {
                        continue;
                    }
                    entry.compatibility = Some(match verdict {
                        Verdict::Compatible => Compat::Compatible,
                        Verdict::Incompatible => Compat::Incompatible,
                        Verdict::Error => Compat::Error,
                    });
                    match verdict {
                        Verdict::Incompatible => job.record_incompatible(path),
                        Verdict::Error => {
                            let path = path.clone();
                            let detail = detail.clone();
                            if let Some(entry) = job.entry_mut(&path) {
                                entry.errors.push(format!("Compatibility probe failed: {detail}"));
                            }
                        }
                        Verdict::Compatible => {}
                    }
                }
                job.recompute_compatibility();
                job.refresh_status();
            });
            if let Err(e) = applied {
                log::error!("Could not apply probe results for {}: {}", job_id, e);
                self.clear_active_flag(job_id);
                return;
            }
        }
    }

    /// Clears the active flag, or keeps it and returns `true` when new
    /// classification work appeared since the caller's last read. The
    /// re-check runs inside the record lock so a concurrently submitted
    /// chunk either sees the flag still set or is swept by this thread.
    fn finish(&self, job_id: &str, on_ready: Option<&(dyn Fn(&str) + Send + Sync)>) -> bool {
        let mut more_work = false;
        let finished = self.store.update(job_id, |job| {
            if !job.status.is_worker_owned() && job.compatibility_pending().next().is_some() {
                more_work = true;
                return;
            }
            job.compatibility_check_active = false;
            job.recompute_compatibility();
            job.refresh_status();
        });
        match finished {
            Ok(job) => {
                if more_work {
                    return true;
                }
                log::info!(
                    "Compatibility sweep finished for {}: {:?}",
                    job_id,
                    job.compatibility_status
                );
                if job.status == JobStatus::Ready {
                    if let Some(on_ready) = on_ready {
                        on_ready(job_id);
                    }
                }
                false
            }
            Err(e) => {
                log::error!("Could not finish sweep for {}: {}", job_id, e);
                false
            }
        }
    }

    fn clear_active_flag(&self, job_id: &str) {
        let _ = self.store.update(job_id, |job| {
            job.compatibility_check_active = false;
        });
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}
