//! Wire protocol for the control socket.
//!
//! Both directions speak newline-delimited JSON: every record is a single
//! self-describing object terminated by exactly one `\n`. Outbound records
//! carry an `event` discriminant, inbound commands an `action` field.
//! serde_json escapes control characters inside string values, so a framed
//! record can never contain an unescaped newline.

use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::manifest::QuarantineEntry;

/// Outbound record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ScanClean,
    ScanThreat,
    Quarantine,
    Restore,
    Delete,
    Status,
    SyncEntry,
    SyncComplete,
}

/// A broadcast event as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: EventKind,
    pub filename: String,
    pub threat: String,
    pub details: String,
    /// ISO-8601 local time, second precision.
    pub timestamp: String,
}

impl EventRecord {
    pub fn now(event: EventKind, filename: &str, threat: &str, details: &str) -> Self {
        Self {
            event,
            filename: filename.to_string(),
            threat: threat.to_string(),
            details: details.to_string(),
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        }
    }
}

/// One quarantine entry replayed to a client during state synchronisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntryRecord {
    pub event: EventKind,
    pub id: String,
    /// The original path of the isolated file.
    pub filename: String,
    pub quarantine_path: String,
    pub threat: String,
    /// Seconds since epoch at isolation time.
    pub timestamp: u64,
}

impl From<&QuarantineEntry> for SyncEntryRecord {
    fn from(entry: &QuarantineEntry) -> Self {
        Self {
            event: EventKind::SyncEntry,
            id: entry.id.clone(),
            filename: entry.original_path.display().to_string(),
            quarantine_path: entry.quarantine_path.display().to_string(),
            threat: entry.threat_name.clone(),
            timestamp: entry.timestamp,
        }
    }
}

/// Terminates a sync batch. `count` is the number of entries sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCompleteRecord {
    pub event: EventKind,
    pub count: usize,
}

impl SyncCompleteRecord {
    pub fn new(count: usize) -> Self {
        Self {
            event: EventKind::SyncComplete,
            count,
        }
    }
}

/// Inbound command actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Restore,
    Delete,
    SyncState,
}

/// An inbound command. Unknown actions or mistyped fields fail to parse and
/// the message is dropped by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    #[serde(default)]
    pub id: Option<String>,
}

/// Encode a record as a single framed line.
pub fn encode_line<T: Serialize>(record: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Bounded accumulator for partial reads on a client connection.
///
/// Complete messages are delimited by `\n`; trailing partial data is kept
/// across reads. A partial message or a single line growing past the
/// capacity discards the data and reports the overflow so the caller can
/// log a warning.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Feed freshly read bytes; returns the complete lines now available and
    /// whether an overflow reset occurred.
    pub fn push(&mut self, bytes: &[u8]) -> (Vec<String>, bool) {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut overflowed = false;

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.len() > self.capacity {
                overflowed = true;
                continue;
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }

        if self.buf.len() > self.capacity {
            self.buf.clear();
            overflowed = true;
        }

        (lines, overflowed)
    }
}
