//! Node configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use strand_log::LogConfig;

/// Segment sizing for the user-visible log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Seal threshold for a segment's store file.
    #[serde(default = "default_max_store_bytes")]
    pub max_store_bytes: u64,
    /// Seal threshold and preallocation size for a segment's index file.
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: u64,
    /// Offset of the first record in a fresh log.
    #[serde(default)]
    pub initial_offset: u64,
}

fn default_max_store_bytes() -> u64 {
    1024
}

fn default_max_index_bytes() -> u64 {
    1024
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: default_max_store_bytes(),
            max_index_bytes: default_max_index_bytes(),
            initial_offset: 0,
        }
    }
}

impl SegmentConfig {
    /// The storage-layer config this describes.
    pub fn log_config(&self) -> LogConfig {
        LogConfig::new()
            .with_max_store_bytes(self.max_store_bytes)
            .with_max_index_bytes(self.max_index_bytes)
            .with_initial_offset(self.initial_offset)
    }
}

/// Raft timing and maintenance knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Driver tick interval in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Heartbeat interval, in ticks.
    #[serde(default = "default_heartbeat_ticks")]
    pub heartbeat_ticks: u64,
    /// Minimum election timeout, in ticks.
    #[serde(default = "default_min_election_ticks")]
    pub min_election_ticks: u64,
    /// Maximum election timeout, in ticks.
    #[serde(default = "default_max_election_ticks")]
    pub max_election_ticks: u64,
    /// How long an `append` waits for commitment before giving up.
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    /// Raft log entries kept before compacting into a snapshot.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: u64,
    /// Whether this node bootstraps a fresh cluster.
    #[serde(default)]
    pub bootstrap: bool,
}

fn default_tick_interval_ms() -> u64 {
    20
}

fn default_heartbeat_ticks() -> u64 {
    3
}

fn default_min_election_ticks() -> u64 {
    10
}

fn default_max_election_ticks() -> u64 {
    20
}

fn default_commit_timeout_ms() -> u64 {
    5000
}

fn default_compact_threshold() -> u64 {
    1024
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_ticks: default_heartbeat_ticks(),
            min_election_ticks: default_min_election_ticks(),
            max_election_ticks: default_max_election_ticks(),
            commit_timeout_ms: default_commit_timeout_ms(),
            compact_threshold: default_compact_threshold(),
            bootstrap: false,
        }
    }
}

/// Configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique node name within the cluster.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Gossip bind address (`host:port`). The RPC listener binds the same
    /// host on `rpc_port`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port for the shared Raft + client RPC listener.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Directory for the log, Raft state, and segments.
    pub data_dir: PathBuf,

    /// Gossip addresses of existing members to join.
    #[serde(default)]
    pub start_join_addrs: Vec<String>,

    /// ACL policy file; absent means allow-all.
    #[serde(default)]
    pub acl_policy_file: Option<PathBuf>,

    /// Segment sizing.
    #[serde(default)]
    pub segment: SegmentConfig,

    /// Raft timing and maintenance.
    #[serde(default)]
    pub raft: RaftConfig,
}

fn default_node_name() -> String {
    "strand-0".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8401".to_string()
}

fn default_rpc_port() -> u16 {
    8400
}

impl AgentConfig {
    /// A config rooted at `data_dir` with every other field defaulted.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_name: default_node_name(),
            bind_addr: default_bind_addr(),
            rpc_port: default_rpc_port(),
            data_dir: data_dir.into(),
            start_join_addrs: Vec::new(),
            acl_policy_file: None,
            segment: SegmentConfig::default(),
            raft: RaftConfig::default(),
        }
    }

    /// Loads a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Serializes the config as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The gossip bind address, parsed.
    pub fn gossip_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("invalid bind_addr {}", self.bind_addr))
    }

    /// The RPC bind address: the gossip host with [`AgentConfig::rpc_port`].
    pub fn rpc_addr(&self) -> Result<SocketAddr> {
        let gossip = self.gossip_addr()?;
        Ok(SocketAddr::new(gossip.ip(), self.rpc_port))
    }

    /// Sets the node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// Sets the gossip bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Sets the RPC port.
    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    /// Sets the seed members to join.
    pub fn with_start_join_addrs(mut self, addrs: Vec<String>) -> Self {
        self.start_join_addrs = addrs;
        self
    }

    /// Marks this node as the cluster bootstrap.
    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.raft.bootstrap = bootstrap;
        self
    }

    /// Sets the ACL policy file.
    pub fn with_acl_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.acl_policy_file = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::new("/tmp/strand");
        assert_eq!(config.rpc_port, 8400);
        assert_eq!(config.segment.max_store_bytes, 1024);
        assert_eq!(config.segment.max_index_bytes, 1024);
        assert!(!config.raft.bootstrap);
    }

    #[test]
    fn test_rpc_addr_shares_gossip_host() {
        let config = AgentConfig::new("/tmp/strand")
            .with_bind_addr("10.0.0.7:8401")
            .with_rpc_port(9000);

        let addr = config.rpc_addr().unwrap();
        assert_eq!(addr.to_string(), "10.0.0.7:9000");
    }

    #[test]
    fn test_toml_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("strand.toml");

        let config = AgentConfig::new(tmp.path())
            .with_node_name("node-a")
            .with_bootstrap(true);
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node_name, "node-a");
        assert!(loaded.raft.bootstrap);
        assert_eq!(loaded.data_dir, config.data_dir);
    }
}
