//! Simulator configuration.
//!
//! A JSON file with optional sections; every field falls back to a default,
//! so `{}` is a valid three-node in-memory cluster.
//!
//! ```json
//! {
//!   "cluster": { "nodes": ["n1", "n2", "n3"] },
//!   "raft": { "rtt_ms": 50, "pre_vote": true },
//!   "network": { "latency_ms": 5, "rpc_timeout_ms": 500 },
//!   "storage": { "dir": "/var/lib/raft-sim" },
//!   "logging": { "level": "info", "format": "text" }
//! }
//! ```

use raft_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level simulator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node ids, which double as host names in redirects
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeId>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
        }
    }
}

/// Simulated network behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// One-way delivery delay
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Where replicas keep their term, vote and log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// One sub-directory per node; in-memory stores when absent
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error. `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
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

fn default_nodes() -> Vec<NodeId> {
    vec!["n1".into(), "n2".into(), "n3".into()]
}

fn default_latency_ms() -> u64 {
    5
}

fn default_rpc_timeout_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nodes = &self.cluster.nodes;
        if nodes.is_empty() {
            return Err(ConfigError::Invalid("cluster.nodes must not be empty".into()));
        }
        if nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid("node ids must not be blank".into()));
        }
        if nodes.iter().collect::<BTreeSet<_>>().len() != nodes.len() {
            return Err(ConfigError::Invalid("node ids must be unique".into()));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be text or json, got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<SimConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SimConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
