//! Bounded work queue and worker pool.
//!
//! Decouples the monitor from the scan pipeline. The queue is a bounded
//! channel: when it is full, `submit` waits for a worker to dequeue an
//! entry. A dropped candidate would be an un-scanned file, so silent drop
//! does not exist here; `submit` fails only once shutdown has closed the
//! queue, returning the path to the caller.

use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_CAPACITY: usize = 256;

pub struct WorkPool {
    tx: mpsc::Sender<PathBuf>,
    rx: Arc<AsyncMutex<mpsc::Receiver<PathBuf>>>,
    depth: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkPool {
    /// Spawn `workers` consumer tasks over a queue of `capacity` slots.
    /// `work_fn` receives ownership of each dequeued path and runs to
    /// completion even during shutdown.
    pub fn new<F, Fut>(workers: usize, capacity: usize, work_fn: F) -> Self
    where
        F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<PathBuf>(capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let depth = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let work_fn = Arc::new(work_fn);

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let depth = depth.clone();
                let mut shutdown = shutdown_rx.clone();
                let work_fn = work_fn.clone();
                tokio::spawn(async move {
                    debug!(worker, "scan worker started");
                    loop {
                        let msg = {
                            let mut guard = rx.lock().await;
                            tokio::select! {
                                biased;
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow_and_update() {
                                        None
                                    } else {
                                        continue;
                                    }
                                }
                                msg = guard.recv() => msg,
                            }
                        };
                        let Some(path) = msg else { break };
                        depth.fetch_sub(1, Ordering::Relaxed);
                        work_fn(path).await;
                    }
                    debug!(worker, "scan worker stopped");
                })
            })
            .collect();

        Self {
            tx,
            rx,
            depth,
            workers: Mutex::new(handles),
            shutdown_tx,
        }
    }

    /// Hand a candidate to the pool. Waits while the queue is full; the
    /// path comes back as the error once the pool has shut down.
    pub async fn submit(&self, path: PathBuf) -> Result<(), PathBuf> {
        match self.tx.send(path).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(path)) => Err(path),
        }
    }

    /// Approximate queue depth, readable without taking any lock.
    pub fn queue_size(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Stop the pool: workers finish their current item and exit, blocked
    /// submitters are released with an error, and whatever is still queued
    /// is discarded with a count in the log.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut residual = 0usize;
        while rx.try_recv().is_ok() {
            residual += 1;
        }
        if residual > 0 {
            warn!(residual, "dropped unprocessed scan candidates at shutdown");
        }
        info!("work pool stopped");
    }
}
