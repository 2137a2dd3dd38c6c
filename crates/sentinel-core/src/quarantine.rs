//! Quarantine engine.
//!
//! Moves infected files out of their original locations into a
//! permission-restricted directory, keeps a durable manifest of what is
//! held, and supports reversible restore and irreversible delete by id.
//! Every operation serialises on one engine lock; list produces an owned
//! snapshot; relocation prefers an atomic rename and falls back to a
//! copy-then-unlink across filesystems.

use chrono::Utc;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::manifest::{self, Manifest, QuarantineEntry, MANIFEST_FILE_NAME};

/// Free-space margin required beyond the file size before a fallback copy.
const MIN_FREE_SPACE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error("no quarantine entry with id {0}")]
    UnknownId(String),
    #[error("restore target already exists: {0}")]
    TargetExists(PathBuf),
    #[error("insufficient disk space in {dir}: need {required} bytes, {available} available")]
    DiskFull {
        dir: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct QuarantineStore {
    root: PathBuf,
    manifest_path: PathBuf,
    inner: Mutex<Manifest>,
}

impl QuarantineStore {
    /// Create the quarantine root if missing (mode `0700`), discard any
    /// staging leftovers from a previous crash, and load the manifest. A
    /// corrupt manifest is replaced by an empty one with a warning.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, QuarantineError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        restrict_dir_permissions(&root);
        manifest::cleanup_staging(&root);

        let manifest_path = root.join(MANIFEST_FILE_NAME);
        let manifest = Manifest::load(&manifest_path);
        info!(
            root = %root.display(),
            entries = manifest.entries.len(),
            "quarantine store opened"
        );
        Ok(Self {
            root,
            manifest_path,
            inner: Mutex::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a path lies inside the quarantine root. Candidates for which
    /// this holds must never reach the scan pipeline.
    pub fn is_inside(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Isolate an infected file. Returns the fresh entry id.
    pub fn quarantine(&self, path: &Path, signature: &str) -> Result<String, QuarantineError> {
        let mut manifest = self.inner.lock();

        if let Err(e) = set_mode(path, 0o000) {
            warn!(path = %path.display(), error = %e, "cannot lock source before quarantine");
        }

        let id = Uuid::new_v4().to_string();
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        let dest = self.root.join(format!("{id}_{basename}"));

        relocate(path, &dest)?;

        // Past this point the content lives only at `dest`. A failure to
        // commit neutralises the destination rather than leaving an
        // untracked artifact in the store.
        if let Err(e) = set_mode(&dest, 0o000) {
            let _ = fs::remove_file(&dest);
            return Err(e.into());
        }

        manifest.entries.push(QuarantineEntry {
            id: id.clone(),
            original_path: path.to_path_buf(),
            quarantine_path: dest.clone(),
            threat_name: signature.to_string(),
            timestamp: Utc::now().timestamp().max(0) as u64,
        });
        if let Err(e) = manifest.flush(&self.manifest_path) {
            manifest.entries.pop();
            let _ = fs::remove_file(&dest);
            return Err(e.into());
        }

        info!(
            id = %id,
            from = %path.display(),
            to = %dest.display(),
            threat = %signature,
            "file quarantined"
        );
        Ok(id)
    }

    /// Return a quarantined file to its original path with mode `0644` and
    /// drop its manifest entry. Refuses if a file already exists at the
    /// original path. On failure the quarantined file is re-restricted to
    /// `000` and the entry is kept.
    pub fn restore(&self, id: &str) -> Result<QuarantineEntry, QuarantineError> {
        let mut manifest = self.inner.lock();
        let idx = manifest
            .position(id)
            .ok_or_else(|| QuarantineError::UnknownId(id.to_string()))?;
        let entry = manifest.entries[idx].clone();

        if entry.original_path.exists() {
            return Err(QuarantineError::TargetExists(entry.original_path));
        }
        if let Some(parent) = entry.original_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return Err(e.into());
            }
        }

        if let Err(e) = set_mode(&entry.quarantine_path, 0o400) {
            let _ = set_mode(&entry.quarantine_path, 0o000);
            return Err(e.into());
        }
        if let Err(e) = relocate(&entry.quarantine_path, &entry.original_path) {
            let _ = set_mode(&entry.quarantine_path, 0o000);
            return Err(e);
        }
        if let Err(e) = set_mode(&entry.original_path, 0o644) {
            warn!(path = %entry.original_path.display(), error = %e, "restored file kept restricted mode");
        }

        manifest.entries.remove(idx);
        if let Err(e) = manifest.flush(&self.manifest_path) {
            manifest.entries.insert(idx, entry.clone());
            warn!(error = %e, "manifest flush failed after restore; keeping entry");
            return Err(e.into());
        }

        info!(id = %id, path = %entry.original_path.display(), "quarantine entry restored");
        Ok(entry)
    }

    /// Permanently delete a quarantined file and drop its manifest entry.
    /// On unlink failure the entry is kept and the file stays locked.
    pub fn delete(&self, id: &str) -> Result<QuarantineEntry, QuarantineError> {
        let mut manifest = self.inner.lock();
        let idx = manifest
            .position(id)
            .ok_or_else(|| QuarantineError::UnknownId(id.to_string()))?;
        let entry = manifest.entries[idx].clone();

        if let Err(e) = set_mode(&entry.quarantine_path, 0o600) {
            warn!(path = %entry.quarantine_path.display(), error = %e, "cannot widen quarantined file before delete");
        }
        if let Err(e) = fs::remove_file(&entry.quarantine_path) {
            let _ = set_mode(&entry.quarantine_path, 0o000);
            return Err(e.into());
        }

        manifest.entries.remove(idx);
        if let Err(e) = manifest.flush(&self.manifest_path) {
            manifest.entries.insert(idx, entry.clone());
            warn!(error = %e, "manifest flush failed after delete; keeping entry");
            return Err(e.into());
        }

        info!(id = %id, "quarantine entry deleted");
        Ok(entry)
    }

    /// Owned snapshot of the manifest at the moment of the call.
    pub fn list(&self) -> Vec<QuarantineEntry> {
        self.inner.lock().entries.clone()
    }
}

// ── Filesystem helpers ──────────────────────────────────────────────────────

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Move `src` to `dest`, preferring an atomic rename. Across filesystems the
/// rename fails and we copy byte-for-byte then unlink the source, widening
/// the source to owner-read for the duration and re-restricting it on
/// failure paths.
fn relocate(src: &Path, dest: &Path) -> Result<(), QuarantineError> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            warn!(
                from = %src.display(),
                to = %dest.display(),
                error = %rename_err,
                "rename failed, falling back to copy"
            );
            if let Err(e) = set_mode(src, 0o400) {
                warn!(path = %src.display(), error = %e, "cannot widen source for copy");
            }

            let needed = fs::metadata(src).map(|m| m.len()).unwrap_or(0);
            if let Some(parent) = dest.parent() {
                if let Err(e) = check_disk_space(parent, needed) {
                    let _ = set_mode(src, 0o000);
                    return Err(e);
                }
            }

            match fs::copy(src, dest) {
                Ok(_) => {
                    if let Err(e) = fs::remove_file(src) {
                        warn!(path = %src.display(), error = %e, "cannot unlink source after copy");
                    }
                    Ok(())
                }
                Err(copy_err) => {
                    let _ = fs::remove_file(dest);
                    let _ = set_mode(src, 0o000);
                    Err(copy_err.into())
                }
            }
        }
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!(path = %path.display(), error = %e, "cannot restrict quarantine root permissions");
        }
    }
}

/// Check that the filesystem containing `dir` has `needed` bytes plus a
/// safety margin of free space.
fn check_disk_space(dir: &Path, needed: u64) -> Result<(), QuarantineError> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let c_path = match std::ffi::CString::new(dir.to_string_lossy().as_bytes()) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            let stat = unsafe { stat.assume_init() };
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            let required = needed + MIN_FREE_SPACE_BYTES;
            if available < required {
                return Err(QuarantineError::DiskFull {
                    dir: dir.to_path_buf(),
                    required,
                    available,
                });
            }
        } else {
            warn!(dir = %dir.display(), "statvfs failed; skipping space check");
        }
    }
    #[cfg(not(unix))]
    let _ = (dir, needed);
    Ok(())
}
