//! Real-time file-system monitor built on the `notify` crate.
//!
//! Watches are installed per directory by walking each configured root and
//! skipping hidden subtrees, so a `.git` or `.cache` forest never consumes
//! watch descriptors. The backend's sync callback feeds a bridge thread
//! which expands coverage when a new directory arrives, filters hidden
//! paths out of dispatch, and forwards candidate file paths into an async
//! channel: close-after-write, creation, and move-into-tree.
//!
//! Watch-descriptor exhaustion is not fatal: the first "no space" error from
//! the kernel produces a single warning naming the sysctl remediation and
//! watching continues on whatever coverage was achieved.

use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Upper bound on how long shutdown waits for the bridge to notice.
const BRIDGE_POLL: Duration = Duration::from_millis(500);
const CANDIDATE_CHANNEL_DEPTH: usize = 1024;

pub struct FileMonitor {
    stop: Arc<AtomicBool>,
    bridge: Option<std::thread::JoinHandle<()>>,
}

impl FileMonitor {
    /// Walk `roots`, install watches on every non-hidden directory, and
    /// start the bridge thread feeding candidate file paths into the
    /// returned channel.
    pub fn spawn(roots: &[PathBuf]) -> anyhow::Result<(Self, async_mpsc::Receiver<PathBuf>)> {
        let (candidate_tx, candidate_rx) = async_mpsc::channel::<PathBuf>(CANDIDATE_CHANNEL_DEPTH);
        let (sync_tx, sync_rx) = mpsc::channel::<Result<Event, notify::Error>>();
        let stop = Arc::new(AtomicBool::new(false));

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default(),
        )?;

        let mut installer = WatchInstaller {
            watcher,
            limit_warned: false,
        };
        for root in roots {
            if !root.is_dir() {
                warn!(root = %root.display(), "watch root missing or not a directory, skipping");
                continue;
            }
            let installed = installer.install_tree(root);
            info!(root = %root.display(), watches = installed, "watching");
        }

        let roots = roots.to_vec();
        let stop_flag = stop.clone();
        let bridge = std::thread::Builder::new()
            .name("sentinel-monitor".into())
            .spawn(move || loop {
                if stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                match sync_rx.recv_timeout(BRIDGE_POLL) {
                    Ok(Ok(event)) => {
                        for path in classify_event(&event) {
                            // Hidden entries are skipped in dispatch just as
                            // they are skipped during the walk.
                            if has_hidden_component(&roots, &path) {
                                continue;
                            }
                            // A directory arriving in the tree extends
                            // coverage instead of being dispatched.
                            if path.is_dir() {
                                let installed = installer.install_tree(&path);
                                debug!(
                                    dir = %path.display(),
                                    watches = installed,
                                    "new directory watched"
                                );
                                continue;
                            }
                            // Dispatch filter: only existing regular files.
                            if !path.is_file() {
                                continue;
                            }
                            if candidate_tx.blocking_send(path).is_err() {
                                debug!("candidate receiver dropped, monitor bridge exiting");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => installer.report_error(&e),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        debug!("watcher channel closed, monitor bridge exiting");
                        return;
                    }
                }
            })?;

        Ok((
            Self {
                stop,
                bridge: Some(bridge),
            },
            candidate_rx,
        ))
    }

    /// Flip the shutdown flag and join the bridge thread. The bridge
    /// observes the flag within one poll interval; dropping the bridge
    /// tears the watcher backend down with it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.bridge.take() {
            let _ = handle.join();
        }
        info!("file-system monitor stopped");
    }
}

/// Owns the backend watcher and the once-per-run exhaustion warning.
struct WatchInstaller {
    watcher: RecommendedWatcher,
    limit_warned: bool,
}

impl WatchInstaller {
    /// Walk a directory tree, skipping hidden entries, and install one
    /// non-recursive watch per directory. Returns how many were installed.
    fn install_tree(&mut self, root: &Path) -> usize {
        let mut installed = 0usize;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden_name(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "cannot walk directory during watch install");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            match self.watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
                Ok(()) => installed += 1,
                Err(e) => self.report_error(&e),
            }
        }
        installed
    }

    fn report_error(&mut self, error: &notify::Error) {
        if matches!(error.kind, notify::ErrorKind::MaxFilesWatch) {
            if !self.limit_warned {
                self.limit_warned = true;
                warn!(
                    "inotify watch limit reached; coverage is partial. \
                     Raise it with: sysctl fs.inotify.max_user_watches=<higher value>"
                );
            }
            return;
        }
        warn!(error = %error, "file watcher error");
    }
}

/// Extract arrival paths from a raw notify event: close-after-write,
/// creation, and move-into-tree. The bridge decides whether an arrival is a
/// candidate file or a directory needing watches.
fn classify_event(event: &Event) -> Vec<PathBuf> {
    match &event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => event.paths.clone(),
        EventKind::Create(_) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            vec![event.paths[1].clone()]
        }
        _ => Vec::new(),
    }
}

fn is_hidden_name(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Whether any component below the watched roots has a leading dot. The
/// roots themselves may carry whatever names the operator configured.
fn has_hidden_component(roots: &[PathBuf], path: &Path) -> bool {
    let below_root = roots.iter().find_map(|root| path.strip_prefix(root).ok());
    let relevant = below_root.unwrap_or(path);
    relevant
        .components()
        .any(|c| matches!(c, Component::Normal(name) if is_hidden_name(name)))
}

/// Startup estimate of the inotify watch budget: warn the operator when the
/// watched trees approach the per-user limit.
pub fn check_watch_budget(roots: &[PathBuf]) {
    #[cfg(target_os = "linux")]
    {
        let Ok(limit_str) = std::fs::read_to_string("/proc/sys/fs/inotify/max_user_watches")
        else {
            return;
        };
        let Ok(limit) = limit_str.trim().parse::<u64>() else {
            return;
        };
        let mut dir_count: u64 = 0;
        for root in roots {
            if root.is_dir() {
                dir_count += WalkDir::new(root)
                    .follow_links(false)
                    .into_iter()
                    .filter_entry(|e| e.depth() == 0 || !is_hidden_name(e.file_name()))
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_dir())
                    .count() as u64;
            }
        }
        if dir_count > limit / 2 {
            warn!(
                dir_count,
                inotify_limit = limit,
                "watched directories exceed 50% of the inotify watch limit. \
                 Consider: sysctl fs.inotify.max_user_watches={}",
                dir_count * 2
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = roots;
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn event(kind: EventKind, path: &Path) -> Event {
        Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn close_write_and_create_are_arrivals() {
        let p = Path::new("/tmp/fresh.txt");
        let closed = event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            p,
        );
        assert_eq!(classify_event(&closed), vec![p.to_path_buf()]);

        let created = event(EventKind::Create(CreateKind::File), p);
        assert_eq!(classify_event(&created), vec![p.to_path_buf()]);

        let dir = event(EventKind::Create(CreateKind::Folder), Path::new("/tmp/sub"));
        assert_eq!(classify_event(&dir), vec![PathBuf::from("/tmp/sub")]);
    }

    #[test]
    fn move_into_tree_takes_the_destination() {
        let moved_to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            Path::new("/tmp/arrived.txt"),
        );
        assert_eq!(
            classify_event(&moved_to),
            vec![PathBuf::from("/tmp/arrived.txt")]
        );

        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/tmp/old.txt"))
            .add_path(PathBuf::from("/tmp/new.txt"));
        assert_eq!(classify_event(&both), vec![PathBuf::from("/tmp/new.txt")]);
    }

    #[test]
    fn removals_and_plain_metadata_changes_are_ignored() {
        let removed = event(
            EventKind::Remove(notify::event::RemoveKind::File),
            Path::new("/tmp/gone.txt"),
        );
        assert!(classify_event(&removed).is_empty());

        let meta = event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
            Path::new("/tmp/chmodded.txt"),
        );
        assert!(classify_event(&meta).is_empty());
    }

    #[test]
    fn hidden_components_are_judged_below_the_roots() {
        let roots = vec![PathBuf::from("/tmp/.tmpabc")];
        assert!(!has_hidden_component(
            &roots,
            Path::new("/tmp/.tmpabc/visible.txt")
        ));
        assert!(has_hidden_component(
            &roots,
            Path::new("/tmp/.tmpabc/.hidden/file.txt")
        ));
        assert!(has_hidden_component(
            &roots,
            Path::new("/tmp/.tmpabc/sub/.dotfile")
        ));
        assert!(has_hidden_component(&roots, Path::new("/elsewhere/.cache/x")));
    }

    #[tokio::test]
    async fn monitor_emits_a_candidate_for_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = FileMonitor::spawn(&[dir.path().to_path_buf()]).unwrap();

        let target = dir.path().join("fresh.bin");
        std::fs::write(&target, b"some fresh bytes").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no candidate within timeout")
            .expect("channel closed");
        assert_eq!(got.file_name(), target.file_name());

        monitor.stop();
    }

    #[tokio::test]
    async fn new_subdirectories_gain_watches() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = FileMonitor::spawn(&[dir.path().to_path_buf()]).unwrap();

        let subdir = dir.path().join("incoming");
        std::fs::create_dir(&subdir).unwrap();
        // Give the bridge a beat to install the new watch.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let target = subdir.join("payload.bin");
        std::fs::write(&target, b"dropped into a fresh directory").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no candidate within timeout")
            .expect("channel closed");
        assert_eq!(got.file_name(), target.file_name());

        monitor.stop();
    }

    #[tokio::test]
    async fn hidden_subtrees_stay_dark() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = FileMonitor::spawn(&[dir.path().to_path_buf()]).unwrap();

        let hidden = dir.path().join(".cache");
        std::fs::create_dir(&hidden).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        std::fs::write(hidden.join("blob.bin"), b"invisible to the monitor").unwrap();

        // The next candidate through must be the visible file, not anything
        // under the hidden subtree.
        let visible = dir.path().join("visible.bin");
        std::fs::write(&visible, b"plainly observable").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no candidate within timeout")
            .expect("channel closed");
        assert_eq!(got.file_name(), visible.file_name());

        monitor.stop();
    }
}
