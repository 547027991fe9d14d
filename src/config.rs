//! WolfKV Configuration
//!
//! This module provides configuration structures for a WolfKV cluster
//! member: node identity, the static cluster table, port assignments,
//! election timing, WAL tuning and the optional HTTP API.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Main WolfKV configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfKvConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Write-Ahead Log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (1..N, must appear in the cluster table)
    pub id: u32,

    /// Data directory for the KV engine and WAL segments
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// One entry of the static cluster member table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Logical node id (>= 1)
    pub id: u32,

    /// Host (IP or DNS name)
    pub host: String,

    /// Control-plane port (heartbeats, votes, status)
    pub control_port: u16,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Leader's client command port
    #[serde(default = "default_client_port")]
    pub client_port: u16,

    /// Leader's replication port
    #[serde(default = "default_repl_port")]
    pub repl_port: u16,

    /// Base for follower read-only ports: read port = base + node id
    #[serde(default = "default_read_port_base")]
    pub read_port_base: u16,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age after which the leader is presumed dead
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Minimum election window in milliseconds
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election window in milliseconds
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Follower acknowledgements required before a write is confirmed
    /// (0 = auto: half the cluster, so leader + acks form a majority)
    #[serde(default)]
    pub required_acks: usize,

    /// If true, a write whose ack wait times out is rejected with
    /// ERR_NO_QUORUM instead of being acknowledged leader-durable
    #[serde(default)]
    pub strict_write_quorum: bool,

    /// Static list of cluster members (including this node)
    pub members: Vec<MemberConfig>,
}

/// Write-Ahead Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Maximum segment size in bytes before rotation
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: default_segment_max_bytes(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP façade
    #[serde(default)]
    pub enabled: bool,

    /// HTTP bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_api_address(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_client_port() -> u16 {
    7001
}

fn default_repl_port() -> u16 {
    7002
}

fn default_read_port_base() -> u16 {
    7100
}

fn default_heartbeat_interval_ms() -> u64 {
    400
}

fn default_heartbeat_timeout_ms() -> u64 {
    1500
}

fn default_election_timeout_min_ms() -> u64 {
    1200
}

fn default_election_timeout_max_ms() -> u64 {
    1600
}

fn default_segment_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_api_address() -> String {
    "127.0.0.1:7080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl WolfKvConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the type system cannot express
    pub fn validate(&self) -> Result<()> {
        if self.cluster.members.is_empty() {
            return Err(Error::Config("cluster.members must not be empty".into()));
        }

        if !self
            .cluster
            .members
            .iter()
            .any(|m| m.id == self.node.id)
        {
            return Err(Error::Config(format!(
                "node.id {} does not appear in cluster.members",
                self.node.id
            )));
        }

        for member in &self.cluster.members {
            if member.id == 0 {
                return Err(Error::Config("member ids must be >= 1".into()));
            }
        }

        let mut ids: Vec<u32> = self.cluster.members.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.cluster.members.len() {
            return Err(Error::Config("duplicate member ids in cluster table".into()));
        }

        if self.cluster.election_timeout_min_ms > self.cluster.election_timeout_max_ms {
            return Err(Error::Config(
                "election_timeout_min_ms must not exceed election_timeout_max_ms".into(),
            ));
        }

        if self.cluster.required_acks >= self.cluster.members.len()
            && self.cluster.members.len() > 1
        {
            return Err(Error::Config(format!(
                "required_acks {} cannot be satisfied by {} member(s)",
                self.cluster.required_acks,
                self.cluster.members.len()
            )));
        }

        Ok(())
    }

    /// Database name for this node (one KV engine per node)
    pub fn db_name(&self) -> String {
        format!("node{}", self.node.id)
    }

    /// Follower read-only port for a given node id
    pub fn read_port(&self, node_id: u32) -> u16 {
        self.cluster.read_port_base + node_id as u16
    }

    /// Acks required for a confirmed write: explicit value, or half the
    /// cluster so that the leader plus acks form a majority
    pub fn effective_required_acks(&self) -> usize {
        if self.cluster.required_acks > 0 {
            self.cluster.required_acks
        } else {
            self.cluster.members.len() / 2
        }
    }

    /// Example configuration for a three-node localhost cluster
    pub fn example(node_id: u32) -> Self {
        Self {
            node: NodeConfig {
                id: node_id,
                data_dir: default_data_dir(),
            },
            cluster: ClusterConfig {
                members: vec![
                    MemberConfig {
                        id: 1,
                        host: "127.0.0.1".into(),
                        control_port: 8001,
                    },
                    MemberConfig {
                        id: 2,
                        host: "127.0.0.1".into(),
                        control_port: 8002,
                    },
                    MemberConfig {
                        id: 3,
                        host: "127.0.0.1".into(),
                        control_port: 8003,
                    },
                ],
                client_port: default_client_port(),
                repl_port: default_repl_port(),
                read_port_base: default_read_port_base(),
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
                heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
                election_timeout_min_ms: default_election_timeout_min_ms(),
                election_timeout_max_ms: default_election_timeout_max_ms(),
                required_acks: 0,
                strict_write_quorum: false,
            },
            wal: WalConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Serialize this configuration to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
