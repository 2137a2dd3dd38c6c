//! Scanner contract and the clamd adapter.
//!
//! The pipeline depends on an injected [`Scanner`]; any adapter with the
//! same contract is acceptable. The shipped adapter speaks the clamd
//! INSTREAM protocol over its local stream socket: the file content is
//! streamed as big-endian `u32` length + bytes chunks terminated by a zero
//! length, and the text reply carries a trailing ` OK`, ` FOUND` preceded by
//! the signature, or ` ERROR`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::warn;

/// Signatures longer than this are clamped; the value is opaque to us.
pub const MAX_SIGNATURE_CHARS: usize = 255;

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Infected { signature: String },
    /// The scanner could not be reached or the connection broke mid-scan.
    TransportError,
    /// The scanner answered but could not scan the file.
    ScanError,
}

/// The on-access scanning collaborator.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, path: &Path) -> ScanOutcome;
}

/// Adapter for the ClamAV `clamd` daemon.
pub struct ClamdScanner {
    socket: PathBuf,
}

impl ClamdScanner {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn stream_file(&self, path: &Path) -> std::io::Result<String> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        stream.write_all(b"zINSTREAM\0").await?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&(n as u32).to_be_bytes()).await?;
            stream.write_all(&buf[..n]).await?;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

#[async_trait]
impl Scanner for ClamdScanner {
    async fn scan(&self, path: &Path) -> ScanOutcome {
        match self.stream_file(path).await {
            Ok(reply) => parse_reply(&reply),
            Err(e) => {
                warn!(
                    socket = %self.socket.display(),
                    path = %path.display(),
                    error = %e,
                    "clamd unreachable"
                );
                ScanOutcome::TransportError
            }
        }
    }
}

/// Parse a clamd reply such as `stream: OK`, `stream: Eicar-Signature FOUND`
/// or `INSTREAM size limit exceeded. ERROR`. Anything unrecognised is a scan
/// error; the pipeline treats that as fail-closed.
pub fn parse_reply(reply: &str) -> ScanOutcome {
    let line = reply.trim_end_matches(['\0', '\n']).trim();

    if let Some(rest) = line.strip_suffix(" FOUND") {
        let signature = rest.splitn(2, ": ").nth(1).unwrap_or(rest);
        let signature: String = signature.chars().take(MAX_SIGNATURE_CHARS).collect();
        return ScanOutcome::Infected { signature };
    }
    if line.ends_with(" OK") || line == "OK" {
        return ScanOutcome::Clean;
    }
    if line.ends_with("ERROR") {
        return ScanOutcome::ScanError;
    }
    warn!(reply = %line, "unrecognised scanner reply");
    ScanOutcome::ScanError
}
