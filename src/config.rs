use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PeriodicError, Result};

/// Address the server listens on (and clients dial).
///
/// Entry points use a scheme prefix: `tcp://127.0.0.1:5000` or
/// `unix:///tmp/periodic.sock`. A bare `host:port` is treated as TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Tcp(String),
    Unix(PathBuf),
}

impl Listen {
    pub fn parse(entry_point: &str) -> Result<Self> {
        let entry_point = entry_point.trim();
        if let Some(path) = entry_point.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(PeriodicError::Config("empty unix socket path".to_string()));
            }
            return Ok(Listen::Unix(PathBuf::from(path)));
        }
        let addr = entry_point.strip_prefix("tcp://").unwrap_or(entry_point);
        if addr.is_empty() || !addr.contains(':') {
            return Err(PeriodicError::Config(format!(
                "invalid entry point {:?}, expected tcp://host:port or unix:///path",
                entry_point
            )));
        }
        Ok(Listen::Tcp(addr.to_string()))
    }
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listen::Tcp(addr) => write!(f, "tcp://{}", addr),
            Listen::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Which job store backs the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageConfig {
    /// Jobs live only as long as the process.
    #[default]
    Memory,
    /// Jobs are kept in a SQLite database file and survive restarts.
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Listen,
    pub storage: StorageConfig,
    /// Per-frame read timeout on connections. `None` waits forever.
    pub socket_timeout: Option<Duration>,
    /// How long the dispatch loop sleeps when nothing is due.
    pub idle_interval: Duration,
    /// Page size used when rehydrating jobs from storage at startup.
    pub rehydrate_batch: usize,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Listen::Unix(PathBuf::from("/tmp/periodic.sock")),
            storage: StorageConfig::Memory,
            socket_timeout: None,
            idle_interval: Duration::from_secs(60),
            rehydrate_batch: 20,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(listen: Listen) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_parse_tcp() {
        assert_eq!(
            Listen::parse("tcp://127.0.0.1:5000").unwrap(),
            Listen::Tcp("127.0.0.1:5000".to_string())
        );
        assert_eq!(
            Listen::parse("localhost:5000").unwrap(),
            Listen::Tcp("localhost:5000".to_string())
        );
    }

    #[test]
    fn listen_parse_unix() {
        assert_eq!(
            Listen::parse("unix:///tmp/periodic.sock").unwrap(),
            Listen::Unix(PathBuf::from("/tmp/periodic.sock"))
        );
    }

    #[test]
    fn listen_parse_rejects_garbage() {
        assert!(Listen::parse("unix://").is_err());
        assert!(Listen::parse("tcp://").is_err());
        assert!(Listen::parse("nonsense").is_err());
    }

    #[test]
    fn listen_display_round_trips() {
        for s in ["tcp://127.0.0.1:5000", "unix:///tmp/p.sock"] {
            assert_eq!(Listen::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen, Listen::Unix(PathBuf::from("/tmp/periodic.sock")));
        assert_eq!(cfg.storage, StorageConfig::Memory);
        assert!(cfg.socket_timeout.is_none());
        assert_eq!(cfg.idle_interval, Duration::from_secs(60));
        assert_eq!(cfg.rehydrate_batch, 20);
    }

    #[test]
    fn server_config_with_storage() {
        let cfg = ServerConfig::new(Listen::Tcp("127.0.0.1:0".to_string())).with_storage(
            StorageConfig::Sqlite {
                path: PathBuf::from("/var/lib/periodic.db"),
            },
        );
        assert_eq!(cfg.listen, Listen::Tcp("127.0.0.1:0".to_string()));
        assert!(matches!(cfg.storage, StorageConfig::Sqlite { .. }));
    }
}
