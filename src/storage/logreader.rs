//! Committed log queries for replication

use crate::common::Result;
use crate::storage::command::{Command, LogBatch, ReplicatedEntry};
use crate::storage::log::EntryKind;
use crate::storage::tables::TableManager;
use std::sync::Arc;

/// Upper bound on entries returned by a single query
pub const MAX_ENTRIES_PER_QUERY: u64 = 10_000;

pub struct LogReader {
    tables: Arc<TableManager>,
}

impl LogReader {
    pub fn new(tables: Arc<TableManager>) -> Self {
        Self { tables }
    }

    /// Committed entries of `table` starting at `from`, at most `max_entries`,
    /// tagged with the table's shard.
    ///
    /// Fails with `Compacted` when `from` is no longer in the log; the caller
    /// must recover from a snapshot instead. An empty batch means the caller is
    /// up to date.
    pub fn query(&self, table: &str, from: u64, max_entries: u64) -> Result<LogBatch> {
        let table = self.tables.get_table(table)?;
        let commit = table.group().status().applied;
        let from = from.max(1);
        let max = max_entries.clamp(1, MAX_ENTRIES_PER_QUERY) as usize;

        let entries = table
            .group()
            .with_log(|log| log.entries(from, commit, max))?;

        let entries = entries
            .into_iter()
            .map(|entry| {
                let command = match entry.kind {
                    EntryKind::Membership | EntryKind::Noop => None,
                    EntryKind::Command => Some(Command::decode(&entry.payload)?),
                };
                Ok(ReplicatedEntry {
                    index: entry.index,
                    command,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LogBatch {
            shard_id: table.shard_id(),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Config, Error};
    use crate::storage::cluster::StaticCluster;
    use crate::storage::command::PutOp;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn leader_table(tables: &TableManager, name: &str) {
        tables.create_table(name).await.unwrap();
        let table = tables.get_table(name).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !table.group().is_leader() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn put(key: &str) -> Command {
        Command::Put(PutOp {
            key: key.into(),
            value: b"v".to_vec(),
            prev_kv: false,
        })
    }

    #[tokio::test]
    async fn test_query_committed_entries() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.raft.node_host_dir = dir.path().join("host");
        config.table.data_dir = dir.path().join("data");
        config.raft.rtt_ms = 1;
        let cluster = Arc::new(StaticCluster::new(1, &config.members()));
        let tables = Arc::new(TableManager::open(config, cluster).unwrap());
        leader_table(&tables, "orders").await;

        let table = tables.get_table("orders").unwrap();
        for key in ["a", "b"] {
            table
                .group()
                .propose(put(key), Duration::from_secs(1))
                .await
                .unwrap();
        }

        let reader = LogReader::new(tables.clone());
        let batch = reader.query("orders", 0, 100).unwrap();
        assert_eq!(batch.shard_id, table.shard_id());
        let entries = batch.entries;
        let indexes: Vec<u64> = entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        assert!(entries[0].command.is_none());
        assert_eq!(entries[2].command, Some(put("a")));

        assert_eq!(reader.query("orders", 4, 1).unwrap().entries.len(), 1);
        assert!(reader.query("orders", 5, 100).unwrap().entries.is_empty());
        assert!(matches!(
            reader.query("missing", 1, 10),
            Err(Error::TableNotFound(_))
        ));

        // a reset hides the history before it
        tables
            .reset_table("orders", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            reader.query("orders", 1, 100),
            Err(Error::Compacted(6))
        ));
        assert!(reader.query("orders", 6, 100).unwrap().entries.is_empty());
        tables.close().await;
    }
}
