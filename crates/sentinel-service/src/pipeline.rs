//! Per-candidate scan pipeline: the worker body.
//!
//! Fail-closed posture: a file leaves this pipeline either restored to its
//! original permissions after a clean verdict, isolated inside the
//! quarantine store, or locked down at mode `000`. Nothing else.

use sentinel_core::protocol::EventKind;
use sentinel_core::quarantine::QuarantineStore;
use sentinel_core::scanner::{ScanOutcome, Scanner};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::control::EventBus;

pub struct ScanPipeline {
    scanner: Arc<dyn Scanner>,
    store: Arc<QuarantineStore>,
    events: EventBus,
    max_retries: u32,
    retry_delay: Duration,
}

impl ScanPipeline {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        store: Arc<QuarantineStore>,
        events: EventBus,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            scanner,
            store,
            events,
            max_retries,
            retry_delay,
        }
    }

    /// Executed once per dequeued path.
    pub async fn process(&self, path: &Path) {
        let filename = path.display().to_string();

        let original_mode = mode_of(path).unwrap_or(0o644);
        strip_execute_bits(path, original_mode);

        let mut outcome = ScanOutcome::TransportError;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                self.events.broadcast(
                    EventKind::Status,
                    &filename,
                    "",
                    "Scanner offline, retrying",
                );
                tokio::time::sleep(self.retry_delay).await;
                // Transient files are expected; if it vanished, we are done.
                if !path.exists() {
                    debug!(path = %filename, "candidate vanished before retry");
                    return;
                }
            }
            outcome = self.scanner.scan(path).await;
            if !matches!(outcome, ScanOutcome::TransportError) {
                break;
            }
        }

        match outcome {
            ScanOutcome::Clean => {
                if let Err(e) = set_mode(path, original_mode & 0o777) {
                    warn!(path = %filename, error = %e, "cannot restore permissions after clean scan");
                }
                self.events
                    .broadcast(EventKind::ScanClean, &filename, "", "");
                debug!(path = %filename, "scan clean");
            }
            ScanOutcome::Infected { signature } => match self.store.quarantine(path, &signature) {
                Ok(id) => {
                    info!(path = %filename, threat = %signature, id = %id, "threat quarantined");
                    self.events
                        .broadcast(EventKind::ScanThreat, &filename, &signature, "quarantined");
                    self.events
                        .broadcast(EventKind::Quarantine, &filename, &signature, &id);
                }
                Err(e) => {
                    error!(path = %filename, threat = %signature, error = %e, "quarantine failed, locking file down");
                    self.lockdown(path);
                    self.events.broadcast(
                        EventKind::ScanThreat,
                        &filename,
                        &signature,
                        "CRITICAL: quarantine failed, file locked down in place",
                    );
                }
            },
            ScanOutcome::ScanError => {
                warn!(path = %filename, "scanner reported an error, locking file down");
                self.lockdown(path);
                self.events.broadcast(
                    EventKind::Status,
                    &filename,
                    "",
                    "Scan error, file locked down",
                );
            }
            ScanOutcome::TransportError => {
                error!(path = %filename, "scanner unavailable after retries, locking file down");
                self.lockdown(path);
                self.events.broadcast(
                    EventKind::Status,
                    &filename,
                    "",
                    "Scanner unavailable, file locked down",
                );
            }
        }
    }

    fn lockdown(&self, path: &Path) {
        if let Err(e) = set_mode(path, 0o000) {
            error!(path = %path.display(), error = %e, "lockdown failed");
        }
    }
}

fn mode_of(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).ok().map(|m| m.permissions().mode())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

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

/// Pre-scan execute-bit strip. Best effort; the scan proceeds regardless.
fn strip_execute_bits(path: &Path, mode: u32) {
    if mode & 0o111 == 0 {
        return;
    }
    if let Err(e) = set_mode(path, mode & !0o111 & 0o777) {
        warn!(path = %path.display(), error = %e, "cannot strip execute bits");
    }
}
