//! Local control plane: a unix stream socket at a well-known path over
//! which connected clients receive pushed event records, submit commands,
//! and request a full state synchronisation after (re)connecting.
//!
//! Framing is newline-delimited JSON in both directions (see
//! `sentinel_core::protocol`). The socket is deliberately world-accessible:
//! unprivileged desktop processes must connect, and the domain offers no
//! network exposure.

use async_trait::async_trait;
use sentinel_core::manifest::QuarantineEntry;
use sentinel_core::protocol::{
    encode_line, Action, Command, EventKind, EventRecord, LineBuffer, SyncCompleteRecord,
    SyncEntryRecord,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_DEPTH: usize = 512;
const READ_CHUNK_BYTES: usize = 4096;

/// Commands a client may invoke against the quarantine engine. The
/// composition root implements this over the store; the server holds it as
/// a capability and never reaches into globals.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn restore(&self, id: &str) -> anyhow::Result<QuarantineEntry>;
    async fn delete(&self, id: &str) -> anyhow::Result<QuarantineEntry>;
    /// Owned snapshot of the manifest for state synchronisation.
    fn snapshot(&self) -> Vec<QuarantineEntry>;
}

/// Fan-out of pre-framed event lines to every connected client.
///
/// Per client, delivery order equals send order; a client that cannot keep
/// up loses only its own missed records, never their ordering.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self { tx }
    }

    /// Compose a timestamped record and queue it for every connected client.
    pub fn broadcast(&self, event: EventKind, filename: &str, threat: &str, details: &str) {
        let record = EventRecord::now(event, filename, threat, details);
        match encode_line(&record) {
            Ok(line) => {
                let _ = self.tx.send(line);
            }
            Err(e) => warn!(error = %e, "cannot encode event record"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Bind the control socket and run the accept loop as a background task.
pub fn spawn_control_server(
    socket_path: &Path,
    max_clients: usize,
    max_message_bytes: usize,
    handler: Arc<dyn CommandHandler>,
    events: EventBus,
) -> anyhow::Result<JoinHandle<()>> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
    }
    info!(socket = %socket_path.display(), "control plane listening");

    let connected = Arc::new(AtomicUsize::new(0));
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    if connected.load(Ordering::SeqCst) >= max_clients {
                        warn!(max_clients, "client table full, refusing connection");
                        continue;
                    }
                    connected.fetch_add(1, Ordering::SeqCst);
                    let connected = connected.clone();
                    let handler = handler.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            serve_client(stream, handler, events, max_message_bytes).await
                        {
                            debug!(error = %e, "client connection closed");
                        }
                        connected.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control socket accept error");
                    break;
                }
            }
        }
    });
    Ok(task)
}

async fn serve_client(
    stream: UnixStream,
    handler: Arc<dyn CommandHandler>,
    events: EventBus,
    max_message_bytes: usize,
) -> anyhow::Result<()> {
    let mut rx = events.subscribe();
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = LineBuffer::new(max_message_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    info!("control client connected");

    loop {
        tokio::select! {
            read = read_half.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    debug!("control client disconnected");
                    return Ok(());
                }
                let (lines, overflowed) = buf.push(&chunk[..n]);
                if overflowed {
                    warn!("client message overflowed the read buffer, resetting");
                }
                for line in lines {
                    dispatch_command(&line, handler.as_ref(), &events, &mut write_half).await?;
                }
            }
            msg = rx.recv() => {
                match msg {
                    Ok(line) => write_half.write_all(line.as_bytes()).await?,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "slow control client missed events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

/// Parse and execute one inbound record. Malformed input drops the message
/// with a warning and keeps the connection open; only transport failures
/// propagate and close the slot.
async fn dispatch_command(
    line: &str,
    handler: &dyn CommandHandler,
    events: &EventBus,
    write_half: &mut OwnedWriteHalf,
) -> anyhow::Result<()> {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "dropping malformed control message");
            return Ok(());
        }
    };

    match command.action {
        Action::Restore => {
            let Some(id) = command.id else {
                warn!("restore command without id, dropping");
                return Ok(());
            };
            match handler.restore(&id).await {
                Ok(entry) => events.broadcast(
                    EventKind::Restore,
                    &entry.original_path.display().to_string(),
                    &entry.threat_name,
                    &entry.id,
                ),
                Err(e) => {
                    warn!(id = %id, error = %e, "restore failed");
                    events.broadcast(EventKind::Status, "", "", &format!("Restore failed: {e}"));
                }
            }
        }
        Action::Delete => {
            let Some(id) = command.id else {
                warn!("delete command without id, dropping");
                return Ok(());
            };
            match handler.delete(&id).await {
                Ok(entry) => events.broadcast(
                    EventKind::Delete,
                    &entry.original_path.display().to_string(),
                    &entry.threat_name,
                    &entry.id,
                ),
                Err(e) => {
                    warn!(id = %id, error = %e, "delete failed");
                    events.broadcast(EventKind::Status, "", "", &format!("Delete failed: {e}"));
                }
            }
        }
        Action::SyncState => {
            // The batch goes to the requesting client only.
            let entries = handler.snapshot();
            let count = entries.len();
            for entry in &entries {
                let line = encode_line(&SyncEntryRecord::from(entry))?;
                write_half.write_all(line.as_bytes()).await?;
            }
            let line = encode_line(&SyncCompleteRecord::new(count))?;
            write_half.write_all(line.as_bytes()).await?;
            debug!(count, "state synchronisation batch sent");
        }
    }
    Ok(())
}
