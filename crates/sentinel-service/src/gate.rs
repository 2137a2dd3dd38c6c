//! Submission gate between the monitor and the work pool.
//!
//! Every candidate passes these predicates before `submit`; the pool itself
//! does no filtering. Gating up front keeps transient tooling artefacts and
//! the store's own files from ever occupying queue slots.

use std::path::{Component, Path, PathBuf};

/// Transient artefacts of the scanner and of browser/desktop tooling,
/// matched as substrings of the basename.
const TRANSIENT_PATTERNS: &[&str] = &[
    "clamav-",
    "-scantemp",
    "chromecrx_",
    ".org.chromium.",
    ".goutputstream",
];

/// Files smaller than this cannot carry a meaningful payload.
pub const MIN_FILE_BYTES: u64 = 4;

pub struct SubmissionGate {
    watch_roots: Vec<PathBuf>,
    quarantine_root: PathBuf,
    max_file_bytes: u64,
}

impl SubmissionGate {
    pub fn new(watch_roots: Vec<PathBuf>, quarantine_root: PathBuf, max_file_bytes: u64) -> Self {
        Self {
            watch_roots,
            quarantine_root,
            max_file_bytes,
        }
    }

    /// Decide whether a candidate may enter the scan queue.
    pub fn admits(&self, path: &Path) -> bool {
        // Self-exclusion: nothing under the quarantine root is ever scanned.
        if path.starts_with(&self.quarantine_root) {
            return false;
        }
        if self.has_hidden_component(path) {
            return false;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        if TRANSIENT_PATTERNS.iter().any(|p| name.contains(p)) {
            return false;
        }
        let Ok(meta) = std::fs::symlink_metadata(path) else {
            return false;
        };
        if !meta.is_file() {
            return false;
        }
        let len = meta.len();
        len >= MIN_FILE_BYTES && len <= self.max_file_bytes
    }

    /// Hidden entries are skipped below the watched roots; the roots
    /// themselves may carry whatever names the operator configured.
    fn has_hidden_component(&self, path: &Path) -> bool {
        let below_root = self
            .watch_roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok());
        let relevant = below_root.unwrap_or(path);
        relevant.components().any(|c| {
            matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.'))
        })
    }
}
