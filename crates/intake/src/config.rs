use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on the declared size of one upload batch.
pub const MAX_BATCH_GB: u64 = 1024;
pub const MAX_BATCH_BYTES: u64 = MAX_BATCH_GB * 1024 * 1024 * 1024;

/// Cap on the job-level message and error logs.
pub const MAX_LOG_LINES: usize = 1000;

/// Import batch size bounds; the client may request a size inside these.
pub const MIN_IMPORT_BATCH: usize = 1;
pub const MAX_IMPORT_BATCH: usize = 10;
pub const DEFAULT_IMPORT_BATCH: usize = 5;

/// Upper bound on concurrent compatibility probes.
pub const MAX_PROBE_WORKERS: usize = 4;

/// Runtime configuration, resolved once at startup from the environment.
///
/// Every numeric knob is clamped to a sane range so a bad environment
/// value degrades to a usable default instead of crashing page loads.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Root directory for job records and staged payloads.
    pub staging_root: PathBuf,
    /// Path to the backing store's CLI tool.
    pub cli_path: PathBuf,
    /// Per-file timeout for a compatibility probe.
    pub probe_timeout: Duration,
    /// Per-file timeout for an import invocation.
    pub import_timeout: Duration,
    /// Bounded wait for the per-user import lock.
    pub user_lock_timeout: Duration,
    /// Minimum interval between cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Age after which done/error jobs are deleted.
    pub cleanup_max_age: Duration,
    /// Age after which in-progress or unreadable jobs are deleted.
    pub cleanup_stale_age: Duration,
    /// Maximum records deleted per sweep.
    pub cleanup_max_delete: usize,
}

impl IntakeConfig {
    pub fn from_env() -> Self {
        let staging_root = std::env::var_os("INTAKE_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("intake-uploads"));
        let cli_path = std::env::var_os("INTAKE_STORE_CLI")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("omero"));

        Self {
            staging_root,
            cli_path,
            probe_timeout: env_secs("INTAKE_PROBE_TIMEOUT_SECS", 45, 5, 600),
            import_timeout: env_secs("INTAKE_IMPORT_TIMEOUT_SECS", 7200, 60, 86_400),
            user_lock_timeout: env_secs("INTAKE_IMPORT_LOCK_TIMEOUT_SECS", 900, 60, 7200),
            cleanup_interval: env_secs("INTAKE_CLEANUP_INTERVAL_SECS", 300, 10, 21_600),
            cleanup_max_age: env_secs("INTAKE_CLEANUP_MAX_AGE_SECS", 12 * 3600, 60, 14 * 86_400),
            cleanup_stale_age: env_secs(
                "INTAKE_CLEANUP_STALE_AGE_SECS",
                48 * 3600,
                300,
                30 * 86_400,
            ),
            cleanup_max_delete: env_usize("INTAKE_CLEANUP_MAX_DELETE", 25, 1, 500),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            staging_root: std::env::temp_dir().join("intake-uploads"),
            cli_path: PathBuf::from("omero"),
            probe_timeout: Duration::from_secs(45),
            import_timeout: Duration::from_secs(7200),
            user_lock_timeout: Duration::from_secs(900),
            cleanup_interval: Duration::from_secs(300),
            cleanup_max_age: Duration::from_secs(12 * 3600),
            cleanup_stale_age: Duration::from_secs(48 * 3600),
            cleanup_max_delete: 25,
        }
    }
}

fn env_secs(name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_secs(env_clamped(name, default, min, max))
}

fn env_usize(name: &str, default: u64, min: u64, max: u64) -> usize {
    env_clamped(name, default, min, max) as usize
}

fn env_clamped(name: &str, default: u64, min: u64, max: u64) -> u64 {
    let value = match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Ignoring non-numeric {}={:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    };
    value.clamp(min, max)
}

/// Clamps a client-requested import batch size into the supported range.
pub fn normalize_batch_size(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_IMPORT_BATCH)
        .clamp(MIN_IMPORT_BATCH, MAX_IMPORT_BATCH)
}
