//! Configuration for one consensus core.
//!
//! Hierarchical loading with the usual override order (later wins):
//! 1. Type defaults from code
//! 2. Configuration file named by `CONFIG_PATH`
//! 3. Environment variables with the `RAFTCELL__` prefix


use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Main configuration container for one peer.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServerConfig {
    /// Node identity and initial group membership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Core Raft timing and replication parameters
    #[serde(default)]
    pub raft: RaftConfig,

    /// At-most-once client retry cache
    #[serde(default)]
    pub retry_cache: RetryCacheConfig,
}

impl ServerConfig {
    /// Loads configuration with hierarchical override support. A `None`
    /// path falls back to the `CONFIG_PATH` environment variable; when
    /// neither names a file, code defaults apply.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder();

        let path = config_path.or_else(|| env::var("CONFIG_PATH").ok().map(PathBuf::from));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(Environment::with_prefix("RAFTCELL").separator("__"));

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        self.retry_cache.validate()?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClusterConfig {
    /// This node's peer id
    #[serde(default)]
    pub node_id: String,

    /// The Raft group this node belongs to
    #[serde(default)]
    pub group_id: String,

    /// Initial peers of the group, including this node
    #[serde(default)]
    pub initial_peers: Vec<PeerEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: String,
    pub address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RaftConfig {
    /// Lower bound of the follower election timeout, in milliseconds
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    /// Upper bound of the follower election timeout, in milliseconds
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat interval, in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// An appender without a successful round-trip for this long is
    /// reported as slow
    #[serde(default = "default_rpc_slowness_timeout")]
    pub rpc_slowness_timeout_ms: u64,

    /// Per-RPC timeout for outbound vote/append/snapshot requests
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Chunk-mode snapshot transfer when true, state-machine notification
    /// when false; both sides of a group must agree
    #[serde(default = "default_install_snapshot_enabled")]
    pub install_snapshot_enabled: bool,

    /// Upper bound on an asynchronous state-machine snapshot install
    #[serde(default = "default_install_snapshot_timeout")]
    pub install_snapshot_timeout_ms: u64,

    /// Maximum entries per AppendEntries request
    #[serde(default = "default_max_entries_per_append")]
    pub max_entries_per_append: u64,

    /// Without any leader contact for this long, the state machine is
    /// notified of an extended no-leader condition
    #[serde(default = "default_no_leader_timeout")]
    pub no_leader_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            rpc_slowness_timeout_ms: default_rpc_slowness_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            install_snapshot_enabled: default_install_snapshot_enabled(),
            install_snapshot_timeout_ms: default_install_snapshot_timeout(),
            max_entries_per_append: default_max_entries_per_append(),
            no_leader_timeout_ms: default_no_leader_timeout(),
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "election_timeout_min_ms must be greater than 0".into(),
            ));
        }
        if self.election_timeout_max_ms <= self.election_timeout_min_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "election_timeout_max_ms {} must be greater than election_timeout_min_ms {}",
                self.election_timeout_max_ms, self.election_timeout_min_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "heartbeat_interval_ms {} must be less than election_timeout_min_ms {}",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_entries_per_append must be greater than 0".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig("rpc_timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn rpc_slowness_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_slowness_timeout_ms)
    }

    pub fn install_snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.install_snapshot_timeout_ms)
    }

    pub fn no_leader_timeout(&self) -> Duration {
        Duration::from_millis(self.no_leader_timeout_ms)
    }
}

fn default_election_timeout_min() -> u64 {
    150
}
fn default_election_timeout_max() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_rpc_slowness_timeout() -> u64 {
    60_000
}
fn default_rpc_timeout() -> u64 {
    1_000
}
fn default_install_snapshot_enabled() -> bool {
    true
}
fn default_install_snapshot_timeout() -> u64 {
    30_000
}
fn default_max_entries_per_append() -> u64 {
    100
}
fn default_no_leader_timeout() -> u64 {
    60_000
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RetryCacheConfig {
    /// Entry lifetime, in milliseconds
    #[serde(default = "default_retry_cache_expiry")]
    pub expiry_ms: u64,

    /// Maximum entries before LRU pressure evicts
    #[serde(default = "default_retry_cache_capacity")]
    pub capacity: u64,
}

impl Default for RetryCacheConfig {
    fn default() -> Self {
        Self {
            expiry_ms: default_retry_cache_expiry(),
            capacity: default_retry_cache_capacity(),
        }
    }
}

impl RetryCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(crate::Error::InvalidConfig("retry cache capacity must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

fn default_retry_cache_expiry() -> u64 {
    600_000
}
fn default_retry_cache_capacity() -> u64 {
    4_096
}
