//! Table management
//!
//! Every table is a consensus group with its own shard ID. The node-local
//! catalog (a `MapStore` persisted as JSON) records table descriptors, the
//! last shard ID handed out and replication leases:
//!
//! ```text
//! /tables/<name>    -> TableInfo (JSON)
//! /ids/last-shard   -> last shard ID
//! /leases/<name>    -> Lease (JSON)
//! ```

use crate::common::{timestamp_now_millis, Config, Error, RecoveryType, Result};
use crate::storage::cluster::Cluster;
use crate::storage::command::ResponseHeader;
use crate::storage::group::{ConsensusGroup, GroupConfig};
use crate::storage::kv::{MapStore, Pair};
use crate::storage::snapshot::write_atomic;
use crate::storage::state_machine::TableSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Shard IDs of tables start above this value
pub const TABLE_SHARD_ID_BASE: u64 = 10000;

const TABLES_PATTERN: &str = "/tables/*";
const LAST_SHARD_KEY: &str = "/ids/last-shard";
const CATALOG_FILE: &str = "catalog.json";

fn table_key(name: &str) -> String {
    format!("/tables/{}", name)
}

fn lease_key(name: &str) -> String {
    format!("/leases/{}", name)
}

/// Table descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub shard_id: u64,
    pub recovery_type: RecoveryType,
}

/// Exclusive right to apply replicated entries to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at_ms: u64,
}

/// A table hosted on this node
pub struct Table {
    info: TableInfo,
    group: ConsensusGroup,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn shard_id(&self) -> u64 {
        self.info.shard_id
    }

    pub fn replica_id(&self) -> u64 {
        self.group.replica_id()
    }

    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub fn group(&self) -> &ConsensusGroup {
        &self.group
    }

    pub fn revision(&self) -> u64 {
        self.group.read(|sm| sm.revision())
    }

    /// Last leader index applied through replication
    pub fn leader_index(&self) -> u64 {
        self.group.read(|sm| sm.leader_index())
    }

    /// Leader shard the replicated content came from, 0 before the first
    /// snapshot recovery
    pub fn leader_shard_id(&self) -> u64 {
        self.group.read(|sm| sm.leader_shard_id())
    }

    pub fn header(&self, revision: u64) -> ResponseHeader {
        ResponseHeader {
            shard_id: self.info.shard_id,
            replica_id: self.group.replica_id(),
            revision,
        }
    }
}

pub struct TableManager {
    config: Config,
    cluster: Arc<dyn Cluster>,
    catalog: MapStore,
    catalog_path: PathBuf,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Serializes table creation and removal
    membership: tokio::sync::Mutex<()>,
    /// Serializes lease read-modify-write
    leases: tokio::sync::Mutex<()>,
    /// Serializes catalog file writes
    persist: tokio::sync::Mutex<()>,
}

impl TableManager {
    /// Load the catalog from the node host directory. Groups are started by
    /// `start`.
    pub fn open(config: Config, cluster: Arc<dyn Cluster>) -> Result<Self> {
        std::fs::create_dir_all(&config.raft.node_host_dir)?;
        let catalog_path = config.raft.node_host_dir.join(CATALOG_FILE);

        let catalog = match std::fs::read_to_string(&catalog_path) {
            Ok(json) => MapStore::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MapStore::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            path = %catalog_path.display(),
            tables = catalog.list("/tables").len(),
            leases = catalog.list("/leases").len(),
            "Catalog loaded"
        );

        Ok(Self {
            config,
            cluster,
            catalog,
            catalog_path,
            tables: RwLock::new(HashMap::new()),
            membership: tokio::sync::Mutex::new(()),
            leases: tokio::sync::Mutex::new(()),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    /// Start the consensus group of every table in the catalog
    pub async fn start(&self) -> Result<()> {
        let _guard = self.membership.lock().await;

        for info in self.catalog_tables()? {
            if self.tables.read().unwrap().contains_key(&info.name) {
                continue;
            }
            let table = self.open_table(info)?;
            tracing::info!(
                table = table.name(),
                shard_id = table.shard_id(),
                revision = table.revision(),
                "Table started"
            );
            self.tables
                .write()
                .unwrap()
                .insert(table.name().to_string(), table);
        }
        Ok(())
    }

    pub async fn create_table(&self, name: &str) -> Result<TableInfo> {
        validate_name(name)?;
        let _guard = self.membership.lock().await;

        if self.catalog.exists(&table_key(name)) {
            return Err(Error::TableExists(name.to_string()));
        }

        let shard_id = self.next_shard_id()?;
        let info = TableInfo {
            name: name.to_string(),
            shard_id,
            recovery_type: self.config.table.recovery_type,
        };
        let table = self.open_table(info.clone())?;

        self.catalog
            .set(&table_key(name), &serde_json::to_string(&info)?, shard_id);
        if let Err(e) = self.save_catalog().await {
            self.catalog.delete(&table_key(name));
            table.group().stop().await;
            return Err(e);
        }
        self.tables
            .write()
            .unwrap()
            .insert(name.to_string(), table);

        tracing::info!(
            table = name,
            shard_id,
            recovery_type = %info.recovery_type,
            "Table created"
        );
        Ok(info)
    }

    /// Remove the table from the catalog, stop its group and delete its data.
    ///
    /// The table stays fully in place when the catalog cannot be written.
    /// Leftover directories are only logged: they belong to a shard ID that is
    /// never handed out again.
    pub async fn drop_table(&self, name: &str) -> Result<()> {
        let _guard = self.membership.lock().await;
        let table = self.get_table(name)?;

        {
            let _leases = self.leases.lock().await;
            let removed: Vec<(String, Pair)> = [table_key(name), lease_key(name)]
                .into_iter()
                .filter_map(|key| self.catalog.get(&key).ok().map(|pair| (key, pair)))
                .collect();
            for (key, _) in &removed {
                self.catalog.delete(key);
            }
            if let Err(e) = self.save_catalog().await {
                for (key, pair) in removed {
                    self.catalog.set(&key, &pair.value, pair.ver);
                }
                return Err(e);
            }
        }

        self.tables.write().unwrap().remove(name);
        table.group().stop().await;

        let (log_dir, data_dir) = self.group_dirs(table.shard_id());
        for dir in [log_dir, data_dir] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    table = name,
                    dir = %dir.display(),
                    "Failed to remove table data: {}",
                    e
                ),
            }
        }

        tracing::info!(table = name, shard_id = table.shard_id(), "Table dropped");
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Descriptors of every table, sorted by name
    pub fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let mut tables = self.catalog_tables()?;
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }

    /// Drop the whole content of a table through its log
    pub async fn reset_table(&self, name: &str, timeout: Duration) -> Result<u64> {
        let table = self.get_table(name)?;
        let index = table
            .group()
            .install(TableSnapshot::default(), timeout)
            .await?;
        tracing::warn!(table = name, index, "Table reset");
        Ok(index)
    }

    /// Take or renew the replication lease of a table. Succeeds when the lease
    /// is free, expired or already held by `owner`.
    pub async fn acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.leases.lock().await;
        if !self.catalog.exists(&table_key(name)) {
            return Err(Error::TableNotFound(name.to_string()));
        }

        let now = timestamp_now_millis();
        let key = lease_key(name);
        let mut ver = 1;
        if let Ok(pair) = self.catalog.get(&key) {
            let current: Lease = serde_json::from_str(&pair.value)?;
            if current.owner != owner && current.expires_at_ms > now {
                return Ok(false);
            }
            ver = pair.ver + 1;
        }

        let lease = Lease {
            owner: owner.to_string(),
            expires_at_ms: now + ttl.as_millis() as u64,
        };
        self.catalog.set(&key, &serde_json::to_string(&lease)?, ver);
        self.save_catalog().await?;
        Ok(true)
    }

    /// Give a lease up. Only the owner can release it.
    pub async fn release_lease(&self, name: &str, owner: &str) -> Result<bool> {
        let _guard = self.leases.lock().await;

        let key = lease_key(name);
        let Ok(pair) = self.catalog.get(&key) else {
            return Ok(false);
        };
        let current: Lease = serde_json::from_str(&pair.value)?;
        if current.owner != owner {
            return Ok(false);
        }

        self.catalog.delete(&key);
        self.save_catalog().await?;
        Ok(true)
    }

    pub fn lease(&self, name: &str) -> Result<Option<Lease>> {
        match self.catalog.get(&lease_key(name)) {
            Ok(pair) => Ok(Some(serde_json::from_str(&pair.value)?)),
            Err(Error::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// Stop every group
    pub async fn close(&self) {
        let _guard = self.membership.lock().await;
        let tables: Vec<Arc<Table>> = self
            .tables
            .write()
            .unwrap()
            .drain()
            .map(|(_, table)| table)
            .collect();
        for table in tables {
            table.group().stop().await;
        }
    }

    fn catalog_tables(&self) -> Result<Vec<TableInfo>> {
        self.catalog
            .get_all_values(TABLES_PATTERN)?
            .iter()
            .map(|json| Ok(serde_json::from_str(json)?))
            .collect()
    }

    fn next_shard_id(&self) -> Result<u64> {
        let last = match self.catalog.get(LAST_SHARD_KEY) {
            Ok(pair) => pair.value.parse::<u64>().map_err(|e| {
                Error::Corrupted(format!("last shard id {:?}: {}", pair.value, e))
            })?,
            Err(Error::KeyNotFound) => TABLE_SHARD_ID_BASE,
            Err(e) => return Err(e),
        };
        let next = last + 1;
        self.catalog.set(LAST_SHARD_KEY, &next.to_string(), next);
        Ok(next)
    }

    fn group_dirs(&self, shard_id: u64) -> (PathBuf, PathBuf) {
        let dir_name = format!("{}-{}", shard_id, self.config.node_id);
        (
            self.config.raft.node_host_dir.join("tables").join(&dir_name),
            self.config.table.data_dir.join(&dir_name),
        )
    }

    fn open_table(&self, info: TableInfo) -> Result<Arc<Table>> {
        let (log_dir, data_dir) = self.group_dirs(info.shard_id);
        let raft = &self.config.raft;
        let config = GroupConfig {
            shard_id: info.shard_id,
            replica_id: self.config.node_id,
            members: self.config.members(),
            log_dir,
            data_dir,
            recovery_type: info.recovery_type,
            snapshot_entries: self.config.table.snapshot_entries,
            compaction_overhead: self.config.table.compaction_overhead,
            election_timeout: raft.election_timeout(),
            heartbeat_interval: raft.heartbeat_interval(),
            wal_sync: raft.wal_sync,
        };
        let group = ConsensusGroup::start(config, self.cluster.clone())?;
        Ok(Arc::new(Table { info, group }))
    }

    /// Write the catalog on the blocking pool, latest content wins
    async fn save_catalog(&self) -> Result<()> {
        let _guard = self.persist.lock().await;
        let json = self.catalog.to_json()?;
        let path = self.catalog_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
            .await
            .map_err(|e| Error::Internal(format!("catalog write task failed: {}", e)))?
    }
}


fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("table name must not be empty".into()));
    }
    if name.contains('/') || name.chars().any(|c| c.is_control()) {
        return Err(Error::InvalidArgument(format!(
            "table name {:?} contains forbidden characters",
            name
        )));
    }
    Ok(())
}
