use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ImportError;
use crate::job::model::StoreSession;
use crate::store::cli::StoreCli;

/// Backing-store operations the sidecar pass needs, one fixed
/// signature per capability. Supporting another store version means
/// another implementation selected at startup, never per-call probing.
pub trait DataStore: Send + Sync {
    /// Resolves image names to store ids in one batch call.
    fn find_images_by_name(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, ImportError>;

    /// Attaches a staged file to an existing image.
    fn attach_file(&self, image_id: &str, path: &Path) -> Result<(), ImportError>;
}

/// CLI-backed implementation. Methods are called from worker threads
/// outside any runtime, so each call drives its own small runtime.
pub struct CliDataStore {
    cli: StoreCli,
    session: StoreSession,
    timeout: Duration,
}

impl CliDataStore {
    pub fn new(cli: StoreCli, session: StoreSession, timeout: Duration) -> Self {
        Self {
            cli,
            session,
            timeout,
        }
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output, ImportError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ImportError::Lookup(format!("runtime: {e}")))?;
        Ok(rt.block_on(future))
    }
}

impl DataStore for CliDataStore {
    fn find_images_by_name(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, ImportError> {
        let output =
            self.block_on(self.cli.lookup_images(&self.session, names, self.timeout))?;
        if !output.success {
            return Err(ImportError::Lookup(output.stderr.trim().to_string()));
        }

        // One `name<TAB>id` line per match.
        let mut found = HashMap::new();
        for line in output.stdout.lines() {
            if let Some((name, id)) = line.split_once('\t') {
                found.insert(name.trim().to_string(), id.trim().to_string());
            }
        }
        Ok(found)
    }

    fn attach_file(&self, image_id: &str, path: &Path) -> Result<(), ImportError> {
        let output =
            self.block_on(self.cli.attach(&self.session, image_id, path, self.timeout))?;
        if output.success {
            Ok(())
        } else {
            Err(ImportError::Attach {
                path: path.display().to_string(),
                reason: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Adapter that knows nothing; lookups find no images and attaches
/// succeed silently. Used when a deployment has no sidecar workflow.
#[derive(Default)]
pub struct NullDataStore;

impl DataStore for NullDataStore {
    fn find_images_by_name(
        &self,
        _names: &[String],
    ) -> Result<HashMap<String, String>, ImportError> {
        Ok(HashMap::new())
    }

    fn attach_file(&self, _image_id: &str, _path: &Path) -> Result<(), ImportError> {
        Ok(())
    }
}
