//! Storage engine
//!
//! Facade over the table manager: key/value operations on named tables,
//! each bounded by the configured request timeout.

use crate::common::{Config, Error, Result};
use crate::storage::cluster::{Cluster, StaticCluster};
use crate::storage::command::{
    Command, CommandResult, DeleteRangeOp, DeleteRangeRequest, DeleteRangeResponse, PutOp,
    PutRequest, PutResponse, RangeOp, RangeRequest, RangeResponse, TxnOp, TxnRequest,
    TxnResponse,
};
use crate::storage::logreader::LogReader;
use crate::storage::state_machine::TableSnapshot;
use crate::storage::tables::{Table, TableInfo, TableManager};
use std::sync::Arc;
use std::time::Duration;

pub struct Engine {
    config: Config,
    tables: Arc<TableManager>,
    log_reader: LogReader,
}

impl Engine {
    /// Engine over a static cluster built from the configured members
    pub fn new(config: Config) -> Result<Self> {
        let cluster = Arc::new(StaticCluster::new(config.node_id, &config.members()));
        Self::with_cluster(config, cluster)
    }

    pub fn with_cluster(config: Config, cluster: Arc<dyn Cluster>) -> Result<Self> {
        config.validate()?;
        let tables = Arc::new(TableManager::open(config.clone(), cluster)?);
        Ok(Self {
            log_reader: LogReader::new(tables.clone()),
            config,
            tables,
        })
    }

    /// Start the groups of every known table
    pub async fn start(&self) -> Result<()> {
        self.tables.start().await?;
        tracing::info!(
            node_id = self.config.node_id,
            tables = self.tables.list_tables()?.len(),
            "Engine started"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.tables.close().await;
        tracing::info!(node_id = self.config.node_id, "Engine stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tables(&self) -> &Arc<TableManager> {
        &self.tables
    }

    pub fn log_reader(&self) -> &LogReader {
        &self.log_reader
    }

    pub async fn create_table(&self, name: &str) -> Result<TableInfo> {
        self.tables.create_table(name).await
    }

    pub async fn drop_table(&self, name: &str) -> Result<()> {
        self.tables.drop_table(name).await
    }

    pub fn list_tables(&self) -> Result<Vec<TableInfo>> {
        self.tables.list_tables()
    }

    /// Drop the whole content of a table
    pub async fn reset_table(&self, name: &str) -> Result<()> {
        self.tables
            .reset_table(name, self.config.request_timeout())
            .await
            .map(|_| ())
    }

    /// Wait until the table exists and its group has a leader
    pub async fn wait_for_table(&self, name: &str, timeout: Duration) -> Result<()> {
        let poll = Duration::from_millis(self.config.raft.rtt_ms.max(1));
        let ready = async {
            loop {
                if let Ok(table) = self.tables.get_table(name) {
                    let shard_id = table.shard_id();
                    if table.group().is_leader()
                        || self.tables.cluster().current_leader_for(shard_id).is_some()
                    {
                        return;
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };

        tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| Error::Timeout(format!("table {} not ready within {:?}", name, timeout)))
    }

    /// Consistent copy of a table for shipping to a follower
    pub fn snapshot(&self, name: &str) -> Result<TableSnapshot> {
        let table = self.tables.get_table(name)?;
        Ok(table.group().read(|sm| sm.to_snapshot(table.shard_id())))
    }

    pub async fn range(&self, req: RangeRequest) -> Result<RangeResponse> {
        require_key(&req.key)?;
        let table = self.tables.get_table(&req.table)?;

        if req.linearizable {
            table
                .group()
                .read_index(self.config.request_timeout())
                .await?;
        }

        let single_key = req.range_end.is_empty();
        let op = RangeOp {
            key: req.key,
            range_end: req.range_end,
            limit: req.limit,
            keys_only: req.keys_only,
            count_only: req.count_only,
        };
        let (result, revision) = table.group().read(|sm| (sm.range(&op), sm.revision()));

        if single_key && result.count == 0 {
            return Err(Error::KeyNotFound);
        }
        Ok(RangeResponse {
            header: table.header(revision),
            kvs: result.kvs,
            count: result.count,
            more: result.more,
        })
    }

    pub async fn put(&self, req: PutRequest) -> Result<PutResponse> {
        require_key(&req.key)?;
        let table = self.tables.get_table(&req.table)?;
        let command = Command::Put(PutOp {
            key: req.key,
            value: req.value,
            prev_kv: req.prev_kv,
        });

        match self.propose(&table, command).await? {
            (revision, CommandResult::Put(result)) => Ok(PutResponse {
                header: table.header(revision),
                prev_kv: result.prev_kv,
            }),
            (_, other) => Err(unexpected(other)),
        }
    }

    pub async fn delete_range(&self, req: DeleteRangeRequest) -> Result<DeleteRangeResponse> {
        require_key(&req.key)?;
        let table = self.tables.get_table(&req.table)?;
        let command = Command::DeleteRange(DeleteRangeOp {
            key: req.key,
            range_end: req.range_end,
            count: req.count,
            prev_kv: req.prev_kv,
        });

        match self.propose(&table, command).await? {
            (revision, CommandResult::DeleteRange(result)) => Ok(DeleteRangeResponse {
                header: table.header(revision),
                deleted: result.deleted,
                prev_kvs: result.prev_kvs,
            }),
            (_, other) => Err(unexpected(other)),
        }
    }

    pub async fn txn(&self, req: TxnRequest) -> Result<TxnResponse> {
        let table = self.tables.get_table(&req.table)?;
        let command = Command::Txn(TxnOp {
            compare: req.compare,
            success: req.success,
            failure: req.failure,
        });

        match self.propose(&table, command).await? {
            (revision, CommandResult::Txn(result)) => Ok(TxnResponse {
                header: table.header(revision),
                succeeded: result.succeeded,
                responses: result.responses,
            }),
            (_, other) => Err(unexpected(other)),
        }
    }

    async fn propose(&self, table: &Table, command: Command) -> Result<(u64, CommandResult)> {
        table
            .group()
            .propose(command, self.config.request_timeout())
            .await
    }
}

fn require_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

fn unexpected(result: CommandResult) -> Error {
    Error::Internal(format!("unexpected command result: {:?}", result))
}
