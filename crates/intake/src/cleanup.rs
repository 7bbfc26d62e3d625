use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::context::IntakeContext;
use crate::error::CleanupError;
use crate::job::store::{is_valid_job_id, JobStore};

/// Process-wide throttle: at most one sweep at a time, no more often
/// than the configured interval.
#[derive(Default)]
pub struct SweepThrottle {
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last_run: Option<Instant>,
    running: bool,
}

impl SweepThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the sweep slot. Callers that get `true` must call
    /// [`SweepThrottle::finish`] when done.
    pub fn try_begin(&self, interval: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return false;
        }
        if let Some(last) = state.last_run {
            if last.elapsed() < interval {
                return false;
            }
        }
        state.running = true;
        true
    }

    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.last_run = Some(Instant::now());
    }
}

/// Releases a claimed sweep slot on drop, so a panicking sweep cannot
/// leave the throttle wedged in the running state.
struct SweepSlot<'a>(&'a SweepThrottle);

impl Drop for SweepSlot<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Deletes expired job records and their staged trees, a bounded
/// number per run. Safe to call opportunistically from any entry point.
pub struct CleanupSweeper {
    ctx: Arc<IntakeContext>,
    store: JobStore,
}

impl CleanupSweeper {
    pub fn new(ctx: Arc<IntakeContext>, store: JobStore) -> Self {
        Self { ctx, store }
    }

    /// Runs one sweep if the throttle allows it. Returns the number of
    /// jobs deleted; per-record failures are logged, never raised.
    pub fn sweep(&self) -> usize {
        let config = &self.ctx.config;
        if !self.ctx.sweep_throttle.try_begin(config.cleanup_interval) {
            return 0;
        }
        let _slot = SweepSlot(&self.ctx.sweep_throttle);
        let deleted = self.sweep_inner();
        if deleted > 0 {
            log::info!("Cleanup removed {} upload job(s)", deleted);
        }
        deleted
    }

    fn sweep_inner(&self) -> usize {
        let config = &self.ctx.config;
        let mut deleted = 0;

        for job_id in self.store.job_ids() {
            if deleted >= config.cleanup_max_delete {
                return deleted;
            }
            if self.record_is_expired(&job_id) && self.delete_job(&job_id) {
                deleted += 1;
            }
        }

        // Staging directories whose record is already gone.
        if let Ok(entries) = std::fs::read_dir(self.store.root()) {
            for entry in entries.flatten() {
                if deleted >= config.cleanup_max_delete {
                    break;
                }
                let name = entry.file_name();
                let Some(job_id) = name.to_str() else { continue };
                if !is_valid_job_id(job_id) || !entry.path().is_dir() {
                    continue;
                }
                let has_record = self
                    .store
                    .record_path(job_id)
                    .map(|p| p.exists())
                    .unwrap_or(false);
                if has_record {
                    continue;
                }
                if fs_age(&entry.path()) > config.cleanup_stale_age && self.delete_job(job_id) {
                    deleted += 1;
                }
            }
        }

        deleted
    }

    fn record_is_expired(&self, job_id: &str) -> bool {
        let config = &self.ctx.config;
        match self.store.load(job_id) {
            Ok(job) => {
                let age = chrono_age(job.updated);
                if job.status.is_terminal() {
                    age > config.cleanup_max_age
                } else {
                    age > config.cleanup_stale_age
                }
            }
            Err(_) => {
                // Unreadable records go by file age.
                let Ok(path) = self.store.record_path(job_id) else {
                    return false;
                };
                fs_age(&path) > config.cleanup_stale_age
            }
        }
    }

    fn delete_job(&self, job_id: &str) -> bool {
        let staging = self.store.staging_dir(job_id);
        if let Err(e) = safe_remove_tree(&staging, self.store.root()) {
            log::warn!("Cleanup skipped job {}: {}", job_id, e);
            return false;
        }
        if let Err(e) = self.store.remove_record(job_id) {
            log::warn!("Cleanup could not remove record for {}: {}", job_id, e);
            return false;
        }
        true
    }
}

/// Removes a staging tree, refusing to act when the tree escapes the
/// root or contains a symlink anywhere. A crafted relative path must
/// never be able to aim deletion outside the sandbox.
pub fn safe_remove_tree(path: &Path, root: &Path) -> Result<(), CleanupError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(CleanupError::Remove {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    if meta.file_type().is_symlink() {
        return Err(CleanupError::SymlinkInTree {
            path: path.to_path_buf(),
        });
    }

    let resolved = path.canonicalize().map_err(|e| CleanupError::Remove {
        path: path.to_path_buf(),
        source: e,
    })?;
    let resolved_root = root.canonicalize().map_err(|e| CleanupError::Remove {
        path: root.to_path_buf(),
        source: e,
    })?;
    if !resolved.starts_with(&resolved_root) {
        return Err(CleanupError::OutsideRoot {
            path: path.to_path_buf(),
        });
    }

    check_no_symlinks(&resolved)?;
    std::fs::remove_dir_all(&resolved).map_err(|e| CleanupError::Remove {
        path: resolved.clone(),
        source: e,
    })
}

fn check_no_symlinks(path: &Path) -> Result<(), CleanupError> {
    let entries = std::fs::read_dir(path).map_err(|e| CleanupError::Remove {
        path: path.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| CleanupError::Remove {
            path: path.to_path_buf(),
            source: e,
        })?;
        let meta = std::fs::symlink_metadata(entry.path()).map_err(|e| CleanupError::Remove {
            path: entry.path(),
            source: e,
        })?;
        if meta.file_type().is_symlink() {
            return Err(CleanupError::SymlinkInTree { path: entry.path() });
        }
        if meta.is_dir() {
            check_no_symlinks(&entry.path())?;
        }
    }
    Ok(())
}

fn fs_age(path: &Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .unwrap_or_default()
}

fn chrono_age(updated: chrono::DateTime<chrono::Utc>) -> Duration {
    (chrono::Utc::now() - updated).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;
    use crate::job::model::{Job, JobStatus, StoreSession};
    use tempfile::TempDir;

    fn setup(config: IntakeConfig) -> (TempDir, CleanupSweeper) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("uploads");
        let config = IntakeConfig {
            staging_root: root.clone(),
            ..config
        };
        let ctx = IntakeContext::new(config).unwrap();
        let store = JobStore::new(&root);
        (dir, CleanupSweeper::new(ctx, store))
    }

    fn seed_job(store: &JobStore, status: JobStatus, age: Duration) -> String {
        let mut job = Job::new("alice", StoreSession::default(), None, None);
        job.status = status;
        job.updated = chrono::Utc::now() - chrono::Duration::from_std(age).unwrap();
        let staging = store.staging_dir(&job.job_id);
        std::fs::create_dir_all(staging.join("_staged/u1")).unwrap();
        std::fs::write(staging.join("_staged/u1/f.tif"), b"x").unwrap();
        // Write the record directly so the aged timestamp survives.
        let path = store.record_path(&job.job_id).unwrap();
        std::fs::write(&path, serde_json::to_vec(&job).unwrap()).unwrap();
        job.job_id
    }

    #[test]
    fn test_throttle_blocks_back_to_back_sweeps() {
        let throttle = SweepThrottle::new();
        assert!(throttle.try_begin(Duration::from_secs(60)));
        // In-progress blocks a second claimant.
        assert!(!throttle.try_begin(Duration::from_secs(60)));
        throttle.finish();
        // Interval not yet elapsed.
        assert!(!throttle.try_begin(Duration::from_secs(60)));
        assert!(throttle.try_begin(Duration::ZERO));
    }

    #[test]
    fn test_sweep_slot_released_after_panic() {
        let throttle = SweepThrottle::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            assert!(throttle.try_begin(Duration::ZERO));
            let _slot = SweepSlot(&throttle);
            panic!("sweep blew up");
        }));
        assert!(result.is_err());
        assert!(throttle.try_begin(Duration::ZERO));
    }

    #[test]
    fn test_expired_done_job_is_deleted_and_fresh_kept() {
        let (_dir, sweeper) = setup(IntakeConfig::default());
        let old = seed_job(
            &sweeper.store,
            JobStatus::Done,
            Duration::from_secs(13 * 3600),
        );
        let fresh = seed_job(&sweeper.store, JobStatus::Done, Duration::from_secs(60));

        assert_eq!(sweeper.sweep(), 1);
        assert!(sweeper.store.load(&old).is_err());
        assert!(sweeper.store.load(&fresh).is_ok());
        assert!(!sweeper.store.staging_dir(&old).exists());
    }

    #[test]
    fn test_in_progress_jobs_use_stale_age() {
        let (_dir, sweeper) = setup(IntakeConfig::default());
        let old_but_live = seed_job(
            &sweeper.store,
            JobStatus::Importing,
            Duration::from_secs(24 * 3600),
        );
        let stale = seed_job(
            &sweeper.store,
            JobStatus::Importing,
            Duration::from_secs(72 * 3600),
        );

        assert_eq!(sweeper.sweep(), 1);
        assert!(sweeper.store.load(&old_but_live).is_ok());
        assert!(sweeper.store.load(&stale).is_err());
    }

    #[test]
    fn test_bounded_deletions_per_sweep() {
        let config = IntakeConfig {
            cleanup_max_delete: 2,
            ..IntakeConfig::default()
        };
        let (_dir, sweeper) = setup(config);
        for _ in 0..4 {
            seed_job(
                &sweeper.store,
                JobStatus::Error,
                Duration::from_secs(13 * 3600),
            );
        }
        assert_eq!(sweeper.sweep(), 2);
        assert_eq!(sweeper.store.job_ids().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_in_tree_refuses_deletion() {
        let (_dir, sweeper) = setup(IntakeConfig::default());
        let job_id = seed_job(
            &sweeper.store,
            JobStatus::Done,
            Duration::from_secs(13 * 3600),
        );
        let staging = sweeper.store.staging_dir(&job_id);
        std::os::unix::fs::symlink("/etc", staging.join("escape")).unwrap();

        assert_eq!(sweeper.sweep(), 0);
        assert!(staging.exists());
        assert!(sweeper.store.load(&job_id).is_ok());
    }

    #[test]
    fn test_remove_tree_outside_root_is_refused() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();

        let result = safe_remove_tree(&outside, &root);
        assert!(matches!(result, Err(CleanupError::OutsideRoot { .. })));
        assert!(outside.exists());
    }

    #[test]
    fn test_missing_tree_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(safe_remove_tree(&dir.path().join("gone"), dir.path()).is_ok());
    }

    #[test]
    fn test_orphan_staging_dir_needs_stale_age() {
        let (_dir, sweeper) = setup(IntakeConfig::default());
        // Fresh orphan directory with no record: kept.
        let orphan = sweeper.store.staging_dir(&crate::job::model::new_job_id());
        std::fs::create_dir_all(&orphan).unwrap();
        assert_eq!(sweeper.sweep(), 0);
        assert!(orphan.exists());
    }
}
