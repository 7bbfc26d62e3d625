use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;

use crate::error::JobStoreError;
use crate::job::model::Job;

const UPDATE_LOCK_ATTEMPTS: u32 = 5;
const LOAD_LOCK_ATTEMPTS: u32 = 10;
const LOAD_LOCK_POLL: Duration = Duration::from_millis(100);

/// Durable, lock-protected persistence for job records.
///
/// One JSON file per job under the staging root. All mutation goes
/// through [`JobStore::update`], which holds an exclusive file lock
/// across the read-modify-write and fsyncs before releasing it.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory for a job's payloads, next to its record.
    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn record_path(&self, job_id: &str) -> Result<PathBuf, JobStoreError> {
        if !is_valid_job_id(job_id) {
            return Err(JobStoreError::InvalidJobId(job_id.to_string()));
        }
        Ok(self.root.join(format!("{job_id}.json")))
    }

    pub fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let path = self.record_path(&job.job_id)?;
        std::fs::create_dir_all(&self.root).map_err(|e| JobStoreError::WriteRecord {
            path: self.root.clone(),
            source: e,
        })?;
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| JobStoreError::WriteRecord {
                path: path.clone(),
                source: e,
            })?;
        write_record(&mut file, &path, job)
    }

    /// Reads a job record. Tries a shared lock briefly so a concurrent
    /// `update` finishes first; falls back to an unlocked read of the
    /// last fully-written version.
    pub fn load(&self, job_id: &str) -> Result<Job, JobStoreError> {
        let path = self.record_path(job_id)?;
        let mut file = open_existing(&path, job_id, false)?;

        let mut locked = false;
        for _ in 0..LOAD_LOCK_ATTEMPTS {
            match fs4::FileExt::try_lock_shared(&file) {
                Ok(()) => {
                    locked = true;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(LOAD_LOCK_POLL)
                }
                Err(e) => return Err(JobStoreError::ReadRecord { path, source: e }),
            }
        }

        let result = read_record(&mut file, &path);
        if locked {
            let _ = fs4::FileExt::unlock(&file);
        }
        result
    }

    /// Atomic read-modify-write of one job record.
    ///
    /// Lock contention is retried with jittered backoff; exhausting the
    /// retries is a retryable failure for the caller, not job state.
    pub fn update<F>(&self, job_id: &str, transform: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        let path = self.record_path(job_id)?;
        let mut transform = Some(transform);

        for attempt in 0..UPDATE_LOCK_ATTEMPTS {
            let mut file = open_existing(&path, job_id, true)?;
            match fs4::FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    let result = self.apply_update(&mut file, &path, transform.take());
                    let _ = fs4::FileExt::unlock(&file);
                    return result;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if attempt + 1 < UPDATE_LOCK_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(50..=200);
                        std::thread::sleep(Duration::from_millis(jitter));
                    }
                }
                Err(e) => return Err(JobStoreError::WriteRecord { path, source: e }),
            }
        }

        Err(JobStoreError::LockContended {
            job_id: job_id.to_string(),
        })
    }

    fn apply_update<F>(
        &self,
        file: &mut File,
        path: &Path,
        transform: Option<F>,
    ) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = read_record(file, path)?;
        if let Some(transform) = transform {
            transform(&mut job);
        }
        job.updated = chrono::Utc::now();

        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.set_len(0))
            .map_err(|e| JobStoreError::WriteRecord {
                path: path.to_path_buf(),
                source: e,
            })?;
        write_record(file, path, &job)?;
        Ok(job)
    }

    /// Removes the record file itself. Staged payloads are the cleanup
    /// sweeper's problem.
    pub fn remove_record(&self, job_id: &str) -> Result<(), JobStoreError> {
        let path = self.record_path(job_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobStoreError::WriteRecord { path, source: e }),
        }
    }

    /// All job ids with a record on disk. Files that do not look like
    /// job records are ignored.
    pub fn job_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                let name = name.to_str()?;
                let id = name.strip_suffix(".json")?;
                is_valid_job_id(id).then(|| id.to_string())
            })
            .collect();
        ids.sort();
        ids
    }
}

/// Job ids are 32 hex chars; anything else never touches the filesystem.
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id.len() == 32 && job_id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn open_existing(path: &Path, job_id: &str, write: bool) -> Result<File, JobStoreError> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(path)
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                JobStoreError::NotFound(job_id.to_string())
            } else {
                JobStoreError::ReadRecord {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })
}

fn read_record(file: &mut File, path: &Path) -> Result<Job, JobStoreError> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut content))
        .map_err(|e| JobStoreError::ReadRecord {
            path: path.to_path_buf(),
            source: e,
        })?;
    serde_json::from_str(&content).map_err(|e| JobStoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_record(file: &mut File, path: &Path, job: &Job) -> Result<(), JobStoreError> {
    let bytes = serde_json::to_vec(job).map_err(|e| JobStoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| JobStoreError::WriteRecord {
            path: path.to_path_buf(),
            source: e,
        })
}
