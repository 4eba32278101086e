use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Crawler configuration, injected at session construction so tests can
/// fabricate a record without touching the filesystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// persist downloaded piece bytes next to the per-peer log
    pub piece_download: bool,
    /// one CIDR per line, invalid lines skipped
    pub ipv4_list: PathBuf,
    pub ipv6_list: PathBuf,
    /// engine listen port, v4 and v6
    pub listen_port: u16,
    /// upper bound on peers sampled from the swarm
    pub max_peers: usize,
    /// version tag recorded in every evidence line
    pub version: String,
    /// sleep between engine polls; tests set 0
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            piece_download: true,
            ipv4_list: PathBuf::from("ipv4.txt"),
            ipv6_list: PathBuf::from("ipv6.txt"),
            listen_port: 6881,
            max_peers: 10,
            version: "v1.0".to_string(),
            poll_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).context("failed to parse config")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
