//! Compatibility verdicts from probe tool output.
//!
//! The probe tool's exit code is unreliable, so the verdict is derived
//! from stdout/stderr text alone. All rules live here; when the tool's
//! output format drifts, this module and its table tests are the only
//! things to touch.

/// Banner/summary phrases that disqualify a stdout line from being an
/// import candidate.
const BANNER_PHRASES: &[&str] = &[
    "# group:",
    "to import",
    "file(s)",
    "group(s)",
    "call(s)",
    "parsed into",
    "setid",
    "reader:",
    "dry run",
    "would import",
];

/// Phrases meaning the tool recognized the file and rejected it.
const INCOMPATIBLE_PHRASES: &[&str] = &[
    "unsupported",
    "unknown format",
    "no suitable reader",
    "cannot read",
    "not a supported",
    "cannot determine reader",
    "no reader found",
    "failed to determine reader",
];

/// Phrases meaning the probe itself failed rather than the format.
const FATAL_STDERR_PHRASES: &[&str] = &["no such file", "permission denied", "timeout"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Compatible,
    Incompatible,
    Error,
}

/// Classifies one probe invocation's output.
///
/// 1. Any candidate line on stdout wins: `compatible`, whatever the
///    exit code or stderr said.
/// 2. A known unsupported/no-reader phrase on either stream:
///    `incompatible`.
/// 3. A fatal phrase on stderr with no candidate: `error`.
/// 4. Anything else: `incompatible`, since nothing showed the file is
///    importable.
pub fn classify(stdout: &str, stderr: &str) -> Verdict {
    if has_import_candidates(stdout) {
        return Verdict::Compatible;
    }

    let combined = format!("{}\n{}", stdout, stderr).to_lowercase();
    if INCOMPATIBLE_PHRASES.iter().any(|p| combined.contains(p)) {
        return Verdict::Incompatible;
    }

    let stderr_lower = stderr.to_lowercase();
    if FATAL_STDERR_PHRASES.iter().any(|p| stderr_lower.contains(p)) {
        return Verdict::Error;
    }

    Verdict::Incompatible
}

/// A candidate line is non-blank, not a comment, not a banner phrase,
/// and looks like a path.
pub fn has_import_candidates(stdout: &str) -> bool {
    stdout.lines().any(is_candidate_line)
}

fn is_candidate_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    let lower = trimmed.to_lowercase();
    if BANNER_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains('.')
}
