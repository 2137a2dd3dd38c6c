use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use sentinel_core::config::SentinelConfig;
use sentinel_core::manifest::QuarantineEntry;
use sentinel_core::protocol::EventKind;
use sentinel_core::quarantine::QuarantineStore;
use sentinel_core::scanner::ClamdScanner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

use sentinel_service::control::{spawn_control_server, CommandHandler, EventBus};
use sentinel_service::dispatch::WorkPool;
use sentinel_service::gate::SubmissionGate;
use sentinel_service::monitor::{check_watch_budget, FileMonitor};
use sentinel_service::pipeline::ScanPipeline;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sentinel on-access scanning daemon", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "/etc/sentinel/config.json")]
    config: PathBuf,
}

/// The control plane's capability over the quarantine engine.
struct EngineHandler {
    store: Arc<QuarantineStore>,
}

#[async_trait]
impl CommandHandler for EngineHandler {
    async fn restore(&self, id: &str) -> Result<QuarantineEntry> {
        Ok(self.store.restore(id)?)
    }

    async fn delete(&self, id: &str) -> Result<QuarantineEntry> {
        Ok(self.store.delete(id)?)
    }

    fn snapshot(&self) -> Vec<QuarantineEntry> {
        self.store.list()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = SentinelConfig::load(&cli.config).context("load configuration")?;

    // Subsystems come up in dependency order; any failure here aborts
    // startup with a non-zero exit.
    let store = Arc::new(
        QuarantineStore::open(&config.quarantine.root).context("open quarantine store")?,
    );
    let events = EventBus::new();

    let scanner = Arc::new(ClamdScanner::new(&config.scanner.socket));
    let pipeline = Arc::new(ScanPipeline::new(
        scanner,
        store.clone(),
        events.clone(),
        config.scanner.max_retries,
        Duration::from_secs(config.scanner.retry_delay_secs),
    ));

    let pool = Arc::new(WorkPool::new(config.pool.workers, config.pool.capacity, {
        let pipeline = pipeline.clone();
        move |path: PathBuf| {
            let pipeline = pipeline.clone();
            async move { pipeline.process(&path).await }
        }
    }));

    let handler = Arc::new(EngineHandler {
        store: store.clone(),
    });
    let server = spawn_control_server(
        &config.control.socket,
        config.control.max_clients,
        config.control.max_message_bytes,
        handler,
        events.clone(),
    )
    .context("start control plane")?;

    check_watch_budget(&config.watch.roots);
    let (monitor, mut candidates) =
        FileMonitor::spawn(&config.watch.roots).context("start file-system monitor")?;

    // Monitor-to-pool glue: gate candidates, then submit with back-pressure.
    let gate = SubmissionGate::new(
        config.watch.roots.clone(),
        store.root().to_path_buf(),
        config.scanner.max_file_bytes,
    );
    let glue = {
        let pool = pool.clone();
        tokio::spawn(async move {
            while let Some(path) = candidates.recv().await {
                if !gate.admits(&path) {
                    continue;
                }
                if pool.submit(path).await.is_err() {
                    debug!("work pool closed, submission glue exiting");
                    break;
                }
            }
        })
    };

    events.broadcast(EventKind::Status, "", "", "Sentinel online");
    info!("sentinel started; all subsystems online");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("interrupt received"),
        _ = sigterm.recv() => info!("terminate received"),
    }

    // Shutdown in reverse order. Workers mid-scan run to completion.
    monitor.stop();
    let _ = glue.await;
    pool.shutdown().await;
    events.broadcast(EventKind::Status, "", "", "Sentinel shutting down");
    // One beat for client tasks to drain the final status record.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.abort();
    let _ = std::fs::remove_file(&config.control.socket);
    info!("sentinel stopped");
    Ok(())
}
