//! Configuration for spokekv components
//!
//! Values are layered: serde defaults, then an optional TOML file, then
//! `SPOKEKV__*` environment variables (`__` separates nesting levels, e.g.
//! `SPOKEKV__REPLICATION__LEADER_ADDRESS`).

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID, doubles as the replica ID of every table hosted here
    #[serde(default = "default_node_id")]
    pub node_id: u64,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub table: TableConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Deadline applied to every engine operation
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> u64 {
    1
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            raft: RaftConfig::default(),
            table: TableConfig::default(),
            replication: ReplicationConfig::default(),
            request_timeout_ms: default_request_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SPOKEKV")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::InvalidConfig("node_id must be non-zero".into()));
        }
        if self.raft.rtt_ms == 0 {
            return Err(Error::InvalidConfig("raft.rtt_ms must be non-zero".into()));
        }
        if self.raft.heartbeat_rtt == 0 || self.raft.election_rtt <= 2 * self.raft.heartbeat_rtt {
            return Err(Error::InvalidConfig(
                "raft.election_rtt must be greater than 2 * raft.heartbeat_rtt".into(),
            ));
        }
        if self.raft.initial_members.len() > 1 {
            return Err(Error::InvalidConfig(
                "raft.initial_members must name this node only, other nodes replicate as followers"
                    .into(),
            ));
        }
        if !self.raft.initial_members.is_empty()
            && !self
                .raft
                .initial_members
                .iter()
                .any(|m| m.node_id == self.node_id)
        {
            return Err(Error::InvalidConfig(format!(
                "raft.initial_members does not contain node {}",
                self.node_id
            )));
        }
        if self.table.snapshot_entries != 0
            && self.table.compaction_overhead >= self.table.snapshot_entries
        {
            return Err(Error::InvalidConfig(
                "table.compaction_overhead must be lower than table.snapshot_entries".into(),
            ));
        }
        if self.replication.max_recv_message_size_bytes == 0 {
            return Err(Error::InvalidConfig(
                "replication.max_recv_message_size_bytes must be non-zero".into(),
            ));
        }
        if self.replication.worker.max_recovery_in_flight == 0 {
            return Err(Error::InvalidConfig(
                "replication.worker.max_recovery_in_flight must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Initial members of every consensus group, keyed by node ID.
    pub fn members(&self) -> BTreeMap<u64, String> {
        if self.raft.initial_members.is_empty() {
            return BTreeMap::from([(self.node_id, self.raft.address.clone())]);
        }
        self.raft
            .initial_members
            .iter()
            .map(|m| (m.node_id, m.address.clone()))
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Consensus group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Advertised address of this node
    #[serde(default = "default_raft_address")]
    pub address: String,

    /// Members every new group is bootstrapped with
    #[serde(default)]
    pub initial_members: Vec<MemberConfig>,

    /// Directory holding group logs, snapshots and the table catalog
    #[serde(default = "default_node_host_dir")]
    pub node_host_dir: PathBuf,

    /// Round trip time between nodes
    #[serde(default = "default_rtt")]
    pub rtt_ms: u64,

    /// Election timeout, in RTTs
    #[serde(default = "default_election_rtt")]
    pub election_rtt: u64,

    /// Quorum check interval, in RTTs
    #[serde(default = "default_heartbeat_rtt")]
    pub heartbeat_rtt: u64,

    #[serde(default)]
    pub wal_sync: WalSyncPolicy,
}

fn default_raft_address() -> String {
    "127.0.0.1:5012".to_string()
}
fn default_node_host_dir() -> PathBuf {
    PathBuf::from("./data/node-host")
}
fn default_rtt() -> u64 {
    50
}
fn default_election_rtt() -> u64 {
    20
}
fn default_heartbeat_rtt() -> u64 {
    1
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            address: default_raft_address(),
            initial_members: Vec::new(),
            node_host_dir: default_node_host_dir(),
            rtt_ms: default_rtt(),
            election_rtt: default_election_rtt(),
            heartbeat_rtt: default_heartbeat_rtt(),
            wal_sync: WalSyncPolicy::default(),
        }
    }
}

impl RaftConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.rtt_ms * self.election_rtt)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_ms * self.heartbeat_rtt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub node_id: u64,
    pub address: String,
}

/// When log appends are fsynced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every append
    #[default]
    Always,
    /// flush to the OS only
    Never,
}

/// How a table rebuilds its state after restart or compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryType {
    /// Reuse the on-disk checkpoint, replay the log suffix
    #[default]
    Checkpoint,
    /// Serialize the whole key space into the snapshot
    Snapshot,
}

impl std::fmt::Display for RecoveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryType::Checkpoint => write!(f, "checkpoint"),
            RecoveryType::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Per-table state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Directory holding state machine checkpoints
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub recovery_type: RecoveryType,

    /// Applied entries between snapshots, 0 disables snapshotting
    #[serde(default = "default_snapshot_entries")]
    pub snapshot_entries: u64,

    /// Entries kept in the log after a snapshot
    #[serde(default = "default_compaction_overhead")]
    pub compaction_overhead: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/state-machine")
}
fn default_snapshot_entries() -> u64 {
    10_000
}
fn default_compaction_overhead() -> u64 {
    5_000
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            recovery_type: RecoveryType::default(),
            snapshot_entries: default_snapshot_entries(),
            compaction_overhead: default_compaction_overhead(),
        }
    }
}

/// Replication configuration (both roles)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Base URL of the leader replication API (follower role)
    #[serde(default = "default_leader_address")]
    pub leader_address: String,

    /// Bind address of the replication API (leader role)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Interval of table reconciliation (workers startup/shutdown)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Client TLS material, plain HTTP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Largest log response or snapshot chunk accepted from the leader
    #[serde(default = "default_max_recv_message_size")]
    pub max_recv_message_size_bytes: u64,

    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_leader_address() -> String {
    "http://127.0.0.1:8444".to_string()
}
fn default_listen_address() -> String {
    "0.0.0.0:8444".to_string()
}
fn default_reconcile_interval() -> u64 {
    30_000
}
fn default_max_recv_message_size() -> u64 {
    8 * 1024 * 1024
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            leader_address: default_leader_address(),
            listen_address: default_listen_address(),
            reconcile_interval_ms: default_reconcile_interval(),
            tls: None,
            max_recv_message_size_bytes: default_max_recv_message_size(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

/// Per-table replication worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Leader poll interval once caught up
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease renewal cadence
    #[serde(default = "default_lease_interval")]
    pub lease_interval_ms: u64,

    /// Lease lifetime, defaults to twice the renewal cadence
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,

    #[serde(default = "default_log_rpc_timeout")]
    pub log_rpc_timeout_ms: u64,

    #[serde(default = "default_snapshot_rpc_timeout")]
    pub snapshot_rpc_timeout_ms: u64,

    /// Snapshot transfers allowed to run at once on this node
    #[serde(default = "default_max_recovery_in_flight")]
    pub max_recovery_in_flight: usize,

    /// Snapshot receive throttle, 0 means unlimited
    #[serde(default)]
    pub max_snapshot_recv_bytes_per_second: u64,

    /// Upper bound of entries fetched per log call
    #[serde(default = "default_max_entries_per_call")]
    pub max_entries_per_call: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_poll_interval() -> u64 {
    1_000
}
fn default_lease_interval() -> u64 {
    15_000
}
fn default_log_rpc_timeout() -> u64 {
    60_000
}
fn default_snapshot_rpc_timeout() -> u64 {
    3_600_000
}
fn default_max_recovery_in_flight() -> usize {
    1
}
fn default_max_entries_per_call() -> u64 {
    1_000
}
fn default_backoff_base() -> u64 {
    100
}
fn default_backoff_max() -> u64 {
    10_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            lease_interval_ms: default_lease_interval(),
            lease_ttl_ms: None,
            log_rpc_timeout_ms: default_log_rpc_timeout(),
            snapshot_rpc_timeout_ms: default_snapshot_rpc_timeout(),
            max_recovery_in_flight: default_max_recovery_in_flight(),
            max_snapshot_recv_bytes_per_second: 0,
            max_entries_per_call: default_max_entries_per_call(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_interval(&self) -> Duration {
        Duration::from_millis(self.lease_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.unwrap_or(self.lease_interval_ms * 2))
    }

    pub fn log_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.log_rpc_timeout_ms)
    }

    pub fn snapshot_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_rpc_timeout_ms)
    }
}

/// Client certificate material for the replication connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_filename: PathBuf,
    pub key_filename: PathBuf,
    pub ca_filename: PathBuf,

    /// How often the certificate files are checked for rotation
    #[serde(default = "default_cert_reload_interval")]
    pub reload_interval_ms: u64,
}

fn default_cert_reload_interval() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.members().len(), 1);
        assert_eq!(config.members()[&1], "127.0.0.1:5012");
        assert_eq!(
            config.replication.worker.lease_ttl(),
            Duration::from_secs(30)
        );
        assert_eq!(config.replication.max_recv_message_size_bytes, 8 << 20);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spokekv.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = 2
request_timeout_ms = 250

[raft]
rtt_ms = 5
election_rtt = 10
initial_members = [{{ node_id = 2, address = "127.0.0.1:7000" }}]

[table]
recovery_type = "snapshot"
snapshot_entries = 100
compaction_overhead = 10

[replication.worker]
max_recovery_in_flight = 3
"#
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.table.recovery_type, RecoveryType::Snapshot);
        assert_eq!(config.replication.worker.max_recovery_in_flight, 3);
        assert_eq!(config.members()[&2], "127.0.0.1:7000");
        assert_eq!(config.raft.election_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = Config::default();
        config.node_id = 7;
        config.raft.initial_members = vec![MemberConfig {
            node_id: 1,
            address: "127.0.0.1:1".into(),
        }];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.table.snapshot_entries = 10;
        config.table.compaction_overhead = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.raft.election_rtt = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.replication.max_recv_message_size_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_multi_member_groups() {
        let mut config = Config::default();
        config.raft.initial_members = vec![
            MemberConfig {
                node_id: 1,
                address: "127.0.0.1:5012".into(),
            },
            MemberConfig {
                node_id: 2,
                address: "127.0.0.1:5013".into(),
            },
        ];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("initial_members")));

        config.raft.initial_members.truncate(1);
        config.validate().unwrap();
    }
}
