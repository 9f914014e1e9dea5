use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Identity used in votes and leader hints. Defaults to "{host}:{client_port}".
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(default = "default_consensus_port")]
    pub consensus_port: u16,
    /// Absent means no monitor listener.
    #[serde(default)]
    pub monitor_port: Option<u16>,
    /// Consensus addresses of the other cluster members, "host:port".
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Absent means the node runs non-durable.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_train_epochs")]
    pub train_epochs: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_client_port() -> u16 {
    9000
}
fn default_consensus_port() -> u16 {
    10000
}
fn default_heartbeat_ms() -> u64 {
    1000
}
fn default_election_min_ms() -> u64 {
    3000
}
fn default_election_max_ms() -> u64 {
    5000
}
fn default_rpc_timeout_ms() -> u64 {
    2000
}
fn default_submit_timeout_ms() -> u64 {
    5000
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("worker_storage")
}
fn default_train_epochs() -> usize {
    2000
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval_ms: default_heartbeat_ms(),
            election_timeout_min_ms: default_election_min_ms(),
            election_timeout_max_ms: default_election_max_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            persist_dir: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            dir: default_storage_dir(),
            train_epochs: default_train_epochs(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let fail = |message: String| Error::Config {
            path: path.to_path_buf(),
            message,
        };
        if self.raft.election_timeout_min_ms > self.raft.election_timeout_max_ms {
            return Err(fail("election_timeout_min_ms exceeds election_timeout_max_ms".into()));
        }
        // Followers must outlast several missed heartbeats before calling an election.
        if self.raft.election_timeout_min_ms < 3 * self.raft.heartbeat_interval_ms {
            return Err(fail(format!(
                "election_timeout_min_ms ({}) must be at least 3x heartbeat_interval_ms ({})",
                self.raft.election_timeout_min_ms, self.raft.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn node_id(&self) -> String {
        self.node
            .node_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.node.host, self.node.client_port))
    }

    /// Client-facing address advertised in leader hints and redirects.
    pub fn client_addr(&self) -> (String, u16) {
        (self.node.host.clone(), self.node.client_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft.heartbeat_interval_ms)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.raft.election_timeout_min_ms),
            Duration::from_millis(self.raft.election_timeout_max_ms),
        )
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.raft.rpc_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.raft.submit_timeout_ms)
    }
}
