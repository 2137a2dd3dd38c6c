//! Integration tests for the scan pipeline's fail-closed resolution.
//!
//! Tests cover:
//!  1. Clean verdict restores the original permissions
//!  2. Infected verdict quarantines with manifest/disk agreement
//!  3. Scan error locks the file down
//!  4. Transport exhaustion: retry statuses, then lockdown
//!  5. A file vanishing between retries ends the pipeline silently
//!  6. Execute bits are stripped before the scanner sees the file

use async_trait::async_trait;
use sentinel_core::quarantine::QuarantineStore;
use sentinel_core::scanner::{ScanOutcome, Scanner};
use sentinel_service::control::EventBus;
use sentinel_service::pipeline::ScanPipeline;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[cfg(unix)]
fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Scanner stub with a fixed verdict and a call counter.
struct StubScanner {
    outcome: ScanOutcome,
    calls: AtomicUsize,
}

impl StubScanner {
    fn new(outcome: ScanOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Scanner for StubScanner {
    async fn scan(&self, _path: &Path) -> ScanOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Scanner stub that deletes the file mid-scan, then reports it infected.
/// Used to force a quarantine failure after an infected verdict.
struct VanishingScanner;

#[async_trait]
impl Scanner for VanishingScanner {
    async fn scan(&self, path: &Path) -> ScanOutcome {
        let _ = fs::remove_file(path);
        ScanOutcome::Infected {
            signature: "Unix.Dropper.Generic".into(),
        }
    }
}

/// Scanner stub that records the file mode it observed.
struct ModeProbeScanner {
    seen_mode: AtomicUsize,
}

#[async_trait]
impl Scanner for ModeProbeScanner {
    async fn scan(&self, path: &Path) -> ScanOutcome {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
            self.seen_mode.store(mode as usize, Ordering::SeqCst);
        }
        ScanOutcome::Clean
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<QuarantineStore>,
    events: EventBus,
    sample: PathBuf,
}

fn harness(content: &[u8]) -> Harness {
    let dir = tempdir().unwrap();
    let store = Arc::new(QuarantineStore::open(dir.path().join("quarantine")).unwrap());
    let sample = dir.path().join("sample.bin");
    fs::write(&sample, content).unwrap();
    Harness {
        _dir: dir,
        store,
        events: EventBus::new(),
        sample,
    }
}

fn pipeline(h: &Harness, scanner: Arc<dyn Scanner>, retries: u32) -> ScanPipeline {
    ScanPipeline::new(
        scanner,
        h.store.clone(),
        h.events.clone(),
        retries,
        Duration::from_millis(10),
    )
}

/// Drain every event broadcast so far into (kind, filename, details) tuples.
fn drain(rx: &mut tokio::sync::broadcast::Receiver<String>) -> Vec<(String, String, String)> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        assert!(line.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        out.push((
            v["event"].as_str().unwrap().to_string(),
            v["filename"].as_str().unwrap().to_string(),
            v["details"].as_str().unwrap().to_string(),
        ));
    }
    out
}

// ─── Test 1: clean verdict ──────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn clean_scan_restores_the_original_mode() {
    let h = harness(b"hello");
    set_mode(&h.sample, 0o640);
    let mut rx = h.events.subscribe();

    let scanner = StubScanner::new(ScanOutcome::Clean);
    pipeline(&h, scanner.clone(), 3).process(&h.sample).await;

    assert_eq!(mode_of(&h.sample), 0o640);
    assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "scan_clean");
    assert_eq!(events[0].1, h.sample.display().to_string());
}

// ─── Test 2: infected verdict ───────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn infected_file_lands_in_quarantine() {
    let h = harness(b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-TEST");
    let mut rx = h.events.subscribe();

    let scanner = StubScanner::new(ScanOutcome::Infected {
        signature: "Win.Test.EICAR_HDB-1".into(),
    });
    pipeline(&h, scanner, 3).process(&h.sample).await;

    assert!(!h.sample.exists());
    let entries = h.store.list();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_path, h.sample);
    assert_eq!(entries[0].threat_name, "Win.Test.EICAR_HDB-1");
    assert!(entries[0].quarantine_path.exists());
    assert_eq!(mode_of(&entries[0].quarantine_path), 0o000);

    let events = drain(&mut rx);
    let kinds: Vec<&str> = events.iter().map(|(k, _, _)| k.as_str()).collect();
    assert_eq!(kinds, vec!["scan_threat", "quarantine"]);
    // The quarantine event carries the entry id for the UI.
    assert_eq!(events[1].2, entries[0].id);
}

// ─── Test 2b: quarantine failure is critical ────────────────────────────────

#[tokio::test]
async fn quarantine_failure_broadcasts_critical_and_never_clears() {
    let h = harness(b"dropper payload");
    let mut rx = h.events.subscribe();

    pipeline(&h, Arc::new(VanishingScanner), 3)
        .process(&h.sample)
        .await;

    assert!(h.store.list().is_empty());
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "scan_threat");
    assert!(events[0].2.contains("CRITICAL"));
}

// ─── Test 3: scan error ─────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn scan_error_locks_the_file_down() {
    let h = harness(b"unscannable");
    let mut rx = h.events.subscribe();

    pipeline(&h, StubScanner::new(ScanOutcome::ScanError), 3)
        .process(&h.sample)
        .await;

    assert_eq!(mode_of(&h.sample), 0o000);
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "status");
    assert!(events[0].2.contains("Scan error"));
}

// ─── Test 4: scanner down ───────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn transport_exhaustion_retries_then_locks_down() {
    let h = harness(b"64 bytes of probe data ........................................");
    let mut rx = h.events.subscribe();

    let scanner = StubScanner::new(ScanOutcome::TransportError);
    pipeline(&h, scanner.clone(), 2).process(&h.sample).await;

    // Three attempts for max_retries = 2.
    assert_eq!(scanner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(mode_of(&h.sample), 0o000);

    let events = drain(&mut rx);
    let retry_statuses = events
        .iter()
        .filter(|(k, _, d)| k == "status" && d.contains("retrying"))
        .count();
    assert_eq!(retry_statuses, 2);
    let (kind, _, details) = events.last().unwrap();
    assert_eq!(kind, "status");
    assert!(details.contains("Scanner unavailable"));
}

// ─── Test 5: vanished candidate ─────────────────────────────────────────────

#[tokio::test]
async fn vanished_candidate_ends_the_pipeline_silently() {
    let h = harness(b"fleeting");
    let mut rx = h.events.subscribe();

    let scanner = StubScanner::new(ScanOutcome::TransportError);
    fs::remove_file(&h.sample).unwrap();
    pipeline(&h, scanner.clone(), 3).process(&h.sample).await;

    // One failed attempt, one retry status, then the re-stat notices the
    // file is gone and the pipeline returns without a lockdown status.
    assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(events[0].2.contains("retrying"));
    assert!(h.store.list().is_empty());
}

// ─── Test 6: execute-bit strip ──────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn execute_bits_are_stripped_before_scanning() {
    let h = harness(b"#!/bin/sh\necho owned\n");
    set_mode(&h.sample, 0o755);

    let probe = Arc::new(ModeProbeScanner {
        seen_mode: AtomicUsize::new(0o777),
    });
    pipeline(&h, probe.clone(), 3).process(&h.sample).await;

    let seen = probe.seen_mode.load(Ordering::SeqCst) as u32;
    assert_eq!(seen & 0o111, 0, "scanner saw execute bits: {seen:o}");
    // Clean verdict put the original mode back.
    assert_eq!(mode_of(&h.sample), 0o755);
}
