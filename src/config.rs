//! Server configuration: TOML file with sane defaults, CLI overrides on top.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::protocol::{DEFAULT_BUF_SIZE, DEFAULT_CHUNK_SIZE, MAX_PORTAL_THREADS};

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listener bind address (host:port)
    pub bind: String,

    /// Inclusive port range for portal sockets; 0-0 means ephemeral
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Ceiling on live agents; absent means unlimited
    pub max_connections: Option<u32>,

    /// Ceiling on the server-to-server re-entrant connect count
    pub max_connect_cnt: u32,

    /// Fixed pool draining the startup-parsing queue
    pub read_workers: usize,

    /// Hard cap applied to requested portal thread counts
    pub max_transfer_threads: usize,

    /// On-wire chunk ceiling between transfer headers
    pub chunk_size: usize,

    /// Intermediate copy buffer size
    pub buf_size: usize,

    /// TCP window size hint advertised with a portal; 0 leaves the OS default
    pub window_size: u32,

    /// Heartbeat files and handoff sockets live under here
    pub runtime_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:9247".to_string(),
            port_range_start: 0,
            port_range_end: 0,
            max_connections: None,
            max_connect_cnt: 7,
            read_workers: 5,
            max_transfer_threads: MAX_PORTAL_THREADS.min(num_cpus::get().max(1)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            buf_size: DEFAULT_BUF_SIZE,
            window_size: 0,
            runtime_dir: std::env::temp_dir().join("gangway"),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: ServerConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_workers == 0 {
            anyhow::bail!("read_workers must be at least 1");
        }
        if self.max_transfer_threads == 0 || self.max_transfer_threads > MAX_PORTAL_THREADS {
            anyhow::bail!(
                "max_transfer_threads must be in 1..={}",
                MAX_PORTAL_THREADS
            );
        }
        if self.chunk_size == 0 || self.buf_size == 0 {
            anyhow::bail!("chunk_size and buf_size must be non-zero");
        }
        if self.port_range_end < self.port_range_start {
            anyhow::bail!("port_range_end below port_range_start");
        }
        Ok(())
    }

    /// Heartbeat directory: one file per live agent, named by pid.
    pub fn proc_dir(&self) -> PathBuf {
        self.runtime_dir.join("proc")
    }

    pub fn port_range(&self) -> PortRange {
        PortRange {
            start: self.port_range_start,
            end: self.port_range_end,
        }
    }
}

/// Inclusive port window for portal sockets. 0-0 hands the choice to
/// the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn is_ephemeral(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = ServerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_connections, None);
        assert!(cfg.read_workers >= 1);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gangway.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "bind = \"127.0.0.1:9300\"\nmax_connections = 8\nread_workers = 2"
        )
        .unwrap();

        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9300");
        assert_eq!(cfg.max_connections, Some(8));
        assert_eq!(cfg.read_workers, 2);
        // untouched fields keep their defaults
        assert_eq!(cfg.max_connect_cnt, 7);
    }

    #[test]
    fn bad_values_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.read_workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.port_range_start = 20200;
        cfg.port_range_end = 20100;
        assert!(cfg.validate().is_err());
    }
}
