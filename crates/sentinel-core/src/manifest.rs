//! On-disk manifest of the quarantine store.
//!
//! A single JSON document under a hidden name inside the quarantine root.
//! Every mutation is flushed through a staging file and an atomic rename so
//! a crash can never leave a half-written manifest behind.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

pub const MANIFEST_FILE_NAME: &str = ".manifest";
const MANIFEST_VERSION: u32 = 1;
const STAGING_SUFFIX: &str = ".staging";

/// The durable record of one isolated file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuarantineEntry {
    /// Opaque identifier, unique across the lifetime of the store.
    pub id: String,
    pub original_path: std::path::PathBuf,
    pub quarantine_path: std::path::PathBuf,
    pub threat_name: String,
    /// Seconds since epoch at isolation time.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<QuarantineEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }
}

impl Manifest {
    /// Load the manifest from disk. A missing file is a fresh store; an
    /// unreadable or malformed document is recovered as an empty manifest
    /// with a warning so the daemon keeps running.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read quarantine manifest, starting empty");
                return Self::default();
            }
        };
        match serde_json::from_str(&json) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "quarantine manifest corrupt, starting empty");
                Self::default()
            }
        }
    }

    /// Persist the manifest: staging file, fsync, atomic rename, fsync of
    /// the containing directory.
    pub fn flush(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let parent = path
            .parent()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "manifest has no parent directory"))?;
        let staging = parent.join(format!("{MANIFEST_FILE_NAME}.{}{STAGING_SUFFIX}", Uuid::new_v4()));
        {
            let mut file = File::create(&staging)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&staging, path)?;
        fsync_dir(parent)?;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&QuarantineEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

/// Remove any leftover manifest staging files from a previous crash.
pub fn cleanup_staging(root: &Path) {
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned manifest staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
