use std::sync::Arc;

use crate::cleanup::SweepThrottle;
use crate::config::IntakeConfig;
use crate::error::{Result, UploadError};
use crate::import::locks::ImportLockRegistry;

/// Process-wide context, constructed once at startup and passed by
/// `Arc` into every component. Replaces lazily-initialized globals.
pub struct IntakeContext {
    pub config: IntakeConfig,
    pub import_locks: ImportLockRegistry,
    pub sweep_throttle: SweepThrottle,
}

impl IntakeContext {
    pub fn new(config: IntakeConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.staging_root).map_err(|e| {
            UploadError::CreateDirectory {
                path: config.staging_root.clone(),
                source: e,
            }
        })?;

        Ok(Arc::new(Self {
            config,
            import_locks: ImportLockRegistry::new(),
            sweep_throttle: SweepThrottle::new(),
        }))
    }
}
