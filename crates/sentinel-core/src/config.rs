use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineSettings {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    pub socket: PathBuf,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub workers: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    pub socket: PathBuf,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    pub watch: WatchSettings,
    pub quarantine: QuarantineSettings,
    pub scanner: ScannerSettings,
    pub pool: PoolSettings,
    pub control: ControlSettings,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_clients() -> usize {
    8
}

fn default_max_message_bytes() -> usize {
    4096
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            watch: WatchSettings {
                roots: vec![PathBuf::from("/home"), PathBuf::from("/tmp")],
            },
            quarantine: QuarantineSettings {
                root: PathBuf::from("/opt/quarantine"),
            },
            scanner: ScannerSettings {
                socket: PathBuf::from("/var/run/clamav/clamd.ctl"),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay_secs(),
                max_file_bytes: default_max_file_bytes(),
            },
            pool: PoolSettings {
                workers: 4,
                capacity: 256,
            },
            control: ControlSettings {
                socket: PathBuf::from("/tmp/sentinel_gui.sock"),
                max_clients: default_max_clients(),
                max_message_bytes: default_max_message_bytes(),
            },
        }
    }
}

impl SentinelConfig {
    /// Load the configuration from a JSON document. A missing file yields
    /// the defaults; a malformed one is an initialisation error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_contract() {
        let cfg = SentinelConfig::default();
        assert_eq!(cfg.watch.roots, vec![PathBuf::from("/home"), PathBuf::from("/tmp")]);
        assert_eq!(cfg.quarantine.root, PathBuf::from("/opt/quarantine"));
        assert_eq!(cfg.pool.workers, 4);
        assert_eq!(cfg.pool.capacity, 256);
        assert_eq!(cfg.control.socket, PathBuf::from("/tmp/sentinel_gui.sock"));
        assert_eq!(cfg.control.max_clients, 8);
        assert_eq!(cfg.scanner.max_retries, 3);
        assert_eq!(cfg.scanner.retry_delay_secs, 2);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SentinelConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.pool.capacity, 256);
    }

    #[test]
    fn partial_document_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        std::fs::write(
            &path,
            r#"{
                "watch": {"roots": ["/srv/uploads"]},
                "quarantine": {"root": "/var/lib/sentinel/quarantine"},
                "scanner": {"socket": "/run/clamd.sock"},
                "pool": {"workers": 2, "capacity": 64},
                "control": {"socket": "/run/sentinel.sock"}
            }"#,
        )
        .unwrap();
        let cfg = SentinelConfig::load(&path).unwrap();
        assert_eq!(cfg.watch.roots, vec![PathBuf::from("/srv/uploads")]);
        assert_eq!(cfg.scanner.max_retries, 3);
        assert_eq!(cfg.control.max_clients, 8);
        assert_eq!(cfg.pool.workers, 2);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SentinelConfig::load(&path).is_err());
    }
}
