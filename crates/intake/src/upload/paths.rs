use std::path::{Path, PathBuf};

use crate::error::UploadError;

/// OS/application junk that must never be probed or imported. Only
/// genuine filesystem debris goes here; everything else is forwarded so
/// the backing store decides what it can read.
const ALWAYS_SKIP_FILENAMES: &[&str] = &[
    // Windows
    "thumbs.db",
    "desktop.ini",
    "ehthumbs.db",
    "ehthumbs_vista.db",
    "$recycle.bin",
    "ntuser.dat",
    "ntuser.dat.log",
    "ntuser.ini",
    "iconcache.db",
    // macOS
    ".ds_store",
    ".apdisk",
    ".volumeicon.icns",
    ".fseventsd",
    ".spotlight-v100",
    ".temporaryitems",
    ".trashes",
    // Linux
    ".directory",
    ".trash-1000",
    // Cross-platform applications
    ".picasa.ini",
    ".picasaoriginals",
    ".bridgecache",
    ".bridgecachet",
    ".bridgesort",
    ".adobe",
];

/// Directories whose contents are never imported; any matching path
/// component (case-insensitive) skips the file.
const ALWAYS_SKIP_DIRS: &[&str] = &[
    "lost+found",
    "$recycle.bin",
    "system volume information",
    ".trashes",
    ".spotlight-v100",
    ".fseventsd",
    ".temporaryitems",
];

/// SEM-EDX spectra are plain-text sidecars, attached to a sibling image
/// rather than imported on their own. Only consulted when the job runs
/// in spectra mode; ordinary jobs import their `.txt` files as-is.
const SIDECAR_EXTENSIONS: &[&str] = &["txt"];

/// Validates and normalizes a client-declared relative path.
///
/// Backslashes are treated as separators. Absolute paths, `.`/`..`
/// segments, and empty segments are rejected so a declared path can
/// never escape the staging area or alias another entry.
pub fn safe_relative_path(raw: &str) -> Result<String, UploadError> {
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') {
        return Err(UploadError::InvalidPath(raw.to_string()));
    }
    // Windows drive prefixes are absolute paths too.
    if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
        return Err(UploadError::InvalidPath(raw.to_string()));
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(UploadError::InvalidPath(raw.to_string()));
    }

    Ok(segments.join("/"))
}

/// Final component of a normalized relative path.
pub fn file_name(relative_path: &str) -> &str {
    relative_path.rsplit('/').next().unwrap_or(relative_path)
}

/// True for files that are never importable image data: OS junk,
/// resource forks, and anything under a junk directory.
pub fn should_auto_skip(relative_path: &str) -> bool {
    let name = file_name(relative_path).to_lowercase();
    if ALWAYS_SKIP_FILENAMES.contains(&name.as_str()) || name.starts_with("._") {
        return true;
    }
    let segments: Vec<&str> = relative_path.split('/').collect();
    segments[..segments.len().saturating_sub(1)]
        .iter()
        .any(|segment| ALWAYS_SKIP_DIRS.contains(&segment.to_lowercase().as_str()))
}

/// True for sidecar files that attach to a sibling image.
pub fn is_sidecar(relative_path: &str) -> bool {
    Path::new(file_name(relative_path))
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SIDECAR_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Picks the sibling a sidecar should attach to: the lexicographically
/// first non-sidecar file in the same directory. All sidecars in one
/// directory therefore share a single target image.
pub fn sidecar_target<'a>(
    sidecar_path: &str,
    all_paths: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let dir = parent_dir(sidecar_path);
    all_paths
        .filter(|p| *p != sidecar_path && parent_dir(p) == dir && !is_sidecar(p))
        .min()
        .map(str::to_string)
}

fn parent_dir(relative_path: &str) -> &str {
    match relative_path.rfind('/') {
        Some(idx) => &relative_path[..idx],
        None => "",
    }
}

/// On-disk location for one entry's payload. The `upload_id` level
/// keeps colliding filenames from different directories apart.
pub fn staged_location(staging_dir: &Path, upload_id: &str, relative_path: &str) -> PathBuf {
    staging_dir
        .join("_staged")
        .join(upload_id)
        .join(file_name(relative_path))
}
