use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Result;
use crate::job::model::EntryStatus;
use crate::job::store::JobStore;
use crate::store::adapter::DataStore;
use crate::upload::paths::file_name;

struct SidecarWork {
    relative_path: String,
    staged_path: PathBuf,
    size: u64,
    target_name: String,
}

enum AttachResult {
    Attached,
    Failed(String),
}

/// Secondary pass for sidecar files that attach to a previously
/// imported image instead of being imported themselves.
///
/// Image ids are resolved with one batch lookup; per-file lookups do
/// not scale past tens of entries. Every sidecar counts as processed
/// whether or not its attachment succeeded.
pub fn run_attachment_pass(
    store: &JobStore,
    job_id: &str,
    datastore: &dyn DataStore,
) -> Result<()> {
    let job = store.load(job_id)?;

    let work: Vec<SidecarWork> = job
        .files
        .iter()
        .filter(|e| e.status == EntryStatus::Uploaded)
        .filter_map(|e| {
            e.attach_to.as_ref().map(|target| SidecarWork {
                relative_path: e.relative_path.clone(),
                staged_path: e.staged_path.clone(),
                size: e.size,
                target_name: file_name(target).to_string(),
            })
        })
        .collect();
    if work.is_empty() {
        return Ok(());
    }

    let mut names: Vec<String> = work.iter().map(|w| w.target_name.clone()).collect();
    names.sort();
    names.dedup();

    let images: HashMap<String, String> = match datastore.find_images_by_name(&names) {
        Ok(images) => images,
        Err(e) => {
            log::error!("Sidecar image lookup failed for job {}: {}", job_id, e);
            let reason = e.to_string();
            store.update(job_id, |job| {
                job.push_error(format!("Sidecar image lookup failed: {reason}"));
                for w in &work {
                    if let Some(entry) = job.entry_mut(&w.relative_path) {
                        entry.status = EntryStatus::Error;
                        entry.errors.push(reason.clone());
                        job.imported_bytes += w.size;
                    }
                }
            })?;
            return Ok(());
        }
    };

    let mut results: Vec<(String, u64, AttachResult)> = Vec::new();
    for w in &work {
        let result = match images.get(&w.target_name) {
            Some(image_id) => match datastore.attach_file(image_id, &w.staged_path) {
                Ok(()) => AttachResult::Attached,
                Err(e) => AttachResult::Failed(e.to_string()),
            },
            None => AttachResult::Failed(format!(
                "no imported image named '{}' to attach to",
                w.target_name
            )),
        };
        if matches!(result, AttachResult::Attached) {
            if let Err(e) = std::fs::remove_file(&w.staged_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Could not remove staged sidecar {:?}: {}", w.staged_path, e);
                }
            }
        }
        results.push((w.relative_path.clone(), w.size, result));
    }

    store.update(job_id, |job| {
        for (path, size, result) in &results {
            let Some(entry) = job.entry_mut(path) else {
                continue;
            };
            if entry.status != EntryStatus::Uploaded {
                continue;
            }
            match result {
                AttachResult::Attached => {
                    entry.status = EntryStatus::Imported;
                    job.push_message(format!("Attached sidecar: {path}"));
                }
                AttachResult::Failed(reason) => {
                    entry.status = EntryStatus::Error;
                    entry.errors.push(reason.clone());
                    job.push_error(format!("Attachment failure: {path}"));
                }
            }
            job.imported_bytes += size;
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use crate::job::model::{new_upload_id, FileEntry, Job, StoreSession};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeStore {
        images: HashMap<String, String>,
        attaches: Mutex<Vec<(String, PathBuf)>>,
        fail_lookup: bool,
    }

    impl FakeStore {
        fn with_images(pairs: &[(&str, &str)]) -> Self {
            Self {
                images: pairs
                    .iter()
                    .map(|(n, i)| (n.to_string(), i.to_string()))
                    .collect(),
                attaches: Mutex::default(),
                fail_lookup: false,
            }
        }
    }

    impl DataStore for FakeStore {
        fn find_images_by_name(
            &self,
            names: &[String],
        ) -> std::result::Result<HashMap<String, String>, ImportError> {
            if self.fail_lookup {
                return Err(ImportError::Lookup("connection refused".to_string()));
            }
            Ok(names
                .iter()
                .filter_map(|n| self.images.get(n).map(|i| (n.clone(), i.clone())))
                .collect())
        }

        fn attach_file(
            &self,
            image_id: &str,
            path: &Path,
        ) -> std::result::Result<(), ImportError> {
            self.attaches
                .lock()
                .unwrap()
                .push((image_id.to_string(), path.to_path_buf()));
            Ok(())
        }
    }

    fn setup(entries: &[(&str, Option<&str>)]) -> (TempDir, JobStore, String) {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let mut job = Job::new("alice", StoreSession::default(), None, None);
        for (path, attach_to) in entries {
            let upload_id = new_upload_id();
            let staged = store
                .staging_dir(&job.job_id)
                .join("_staged")
                .join(&upload_id)
                .join(file_name(path));
            std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
            std::fs::write(&staged, b"sidecar").unwrap();
            job.files.push(FileEntry {
                upload_id,
                relative_path: path.to_string(),
                staged_path: staged,
                size: 7,
                status: EntryStatus::Uploaded,
                compatibility: None,
                compatibility_skip: attach_to.is_some(),
                import_skip: attach_to.is_some(),
                attach_to: attach_to.map(String::from),
                errors: Vec::new(),
            });
        }
        job.recompute_total_bytes();
        store.create(&job).unwrap();
        let job_id = job.job_id.clone();
        (dir, store, job_id)
    }

    #[test]
    fn test_attaches_sidecar_to_looked_up_image() {
        let (_dir, store, job_id) = setup(&[("run1/spectra.txt", Some("run1/scan.tif"))]);
        let datastore = FakeStore::with_images(&[("scan.tif", "101")]);

        run_attachment_pass(&store, &job_id, &datastore).unwrap();

        let job = store.load(&job_id).unwrap();
        let entry = job.entry("run1/spectra.txt").unwrap();
        assert_eq!(entry.status, EntryStatus::Imported);
        assert!(!entry.staged_path.exists());
        assert_eq!(job.imported_bytes, 7);

        let attaches = datastore.attaches.lock().unwrap();
        assert_eq!(attaches.len(), 1);
        assert_eq!(attaches[0].0, "101");
    }

    #[test]
    fn test_missing_target_image_is_a_per_file_error() {
        let (_dir, store, job_id) = setup(&[("run1/spectra.txt", Some("run1/scan.tif"))]);
        let datastore = FakeStore::with_images(&[]);

        run_attachment_pass(&store, &job_id, &datastore).unwrap();

        let job = store.load(&job_id).unwrap();
        let entry = job.entry("run1/spectra.txt").unwrap();
        assert_eq!(entry.status, EntryStatus::Error);
        assert!(!job.errors.is_empty());
        // Processed bytes still move for progress purposes.
        assert_eq!(job.imported_bytes, 7);
    }

    #[test]
    fn test_lookup_failure_errors_all_sidecars() {
        let (_dir, store, job_id) = setup(&[
            ("a/x.txt", Some("a/x.tif")),
            ("a/y.txt", Some("a/y.tif")),
        ]);
        let mut datastore = FakeStore::with_images(&[("x.tif", "1"), ("y.tif", "2")]);
        datastore.fail_lookup = true;

        run_attachment_pass(&store, &job_id, &datastore).unwrap();

        let job = store.load(&job_id).unwrap();
        assert!(job
            .files
            .iter()
            .all(|e| e.status == EntryStatus::Error));
        assert_eq!(job.imported_bytes, 14);
    }

    #[test]
    fn test_no_sidecars_is_a_no_op() {
        let (_dir, store, job_id) = setup(&[("a/x.tif", None)]);
        let datastore = FakeStore::with_images(&[]);
        run_attachment_pass(&store, &job_id, &datastore).unwrap();

        let job = store.load(&job_id).unwrap();
        assert_eq!(job.entry("a/x.tif").unwrap().status, EntryStatus::Uploaded);
        assert_eq!(job.imported_bytes, 0);
    }
}
