//! Commands, requests and responses of the table engine
//!
//! `Command` is the unit proposed to a table's consensus group. The request
//! and response structs are the engine's operation contracts.

use serde::{Deserialize, Serialize};

/// A key/value pair. Absence of a key is the only representation of deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Identifies which replica answered and at which revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub shard_id: u64,
    pub replica_id: u64,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// What a comparison inspects, and the expected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Value(Vec<u8>),
    Version(u64),
    CreateRevision(u64),
    ModRevision(u64),
}

/// A transaction guard. With a non-empty `range_end` it must hold for every
/// key of the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    #[serde(default)]
    pub range_end: Vec<u8>,
    pub result: CompareResult,
    pub target: CompareTarget,
}

impl Compare {
    /// Compare the value stored under `key`.
    pub fn value(key: impl Into<Vec<u8>>, result: CompareResult, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: Vec::new(),
            result,
            target: CompareTarget::Value(value.into()),
        }
    }

    /// Compare the version (number of writes since creation) of `key`.
    pub fn version(key: impl Into<Vec<u8>>, result: CompareResult, version: u64) -> Self {
        Self {
            key: key.into(),
            range_end: Vec::new(),
            result,
            target: CompareTarget::Version(version),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOp {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// Maximum number of pairs returned, 0 means unlimited
    pub limit: u64,
    pub keys_only: bool,
    pub count_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOp {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRangeOp {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub count: bool,
    pub prev_kv: bool,
}

/// Operation nested in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOp {
    Range(RangeOp),
    Put(PutOp),
    DeleteRange(DeleteRangeOp),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Number of keys in the range, regardless of `limit`
    pub count: u64,
    /// More keys matched than `limit` allowed
    pub more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRangeResult {
    pub deleted: u64,
    pub prev_kvs: Vec<KeyValue>,
}

/// Result of a nested transaction operation, same position as its request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseOp {
    Range(RangeResult),
    Put(PutResult),
    DeleteRange(DeleteRangeResult),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnOp {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnResult {
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

/// A committed leader log entry shipped to followers. `command` is `None` for
/// entries that carry no key/value change (membership, leader no-op).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    pub index: u64,
    pub command: Option<Command>,
}

/// Committed entries of one leader table. `shard_id` names the leader's
/// consensus group, which changes when the leader drops and recreates the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    pub shard_id: u64,
    pub entries: Vec<ReplicatedEntry>,
}

/// Leader entries proposed to a follower table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateOp {
    /// Leader shard the entries were read from
    pub shard_id: u64,
    pub entries: Vec<ReplicatedEntry>,
}

impl From<LogBatch> for ReplicateOp {
    fn from(batch: LogBatch) -> Self {
        Self {
            shard_id: batch.shard_id,
            entries: batch.entries,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateResult {
    /// Leader index after the batch
    pub leader_index: u64,
    /// Entries applied from the batch
    pub applied: u64,
    /// The batch did not continue from the stored leader index, or came from
    /// another leader shard
    pub gap: bool,
}

/// Unit proposed to a table's consensus group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put(PutOp),
    DeleteRange(DeleteRangeOp),
    Txn(TxnOp),
    /// Batch of leader entries applied by a follower
    Replicate(ReplicateOp),
}

impl Command {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Outcome of applying one log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    /// Entry without a command (membership, no-op)
    Empty,
    Put(PutResult),
    DeleteRange(DeleteRangeResult),
    Txn(TxnResult),
    Replicate(ReplicateResult),
}

// === Engine requests & responses ===

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeRequest {
    pub table: String,
    pub key: Vec<u8>,
    /// Empty: single key. `[0]`: everything from `key`. Otherwise `[key, range_end)`.
    pub range_end: Vec<u8>,
    /// Confirm the commit point with a quorum before reading
    pub linearizable: bool,
    pub limit: u64,
    pub keys_only: bool,
    pub count_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    pub count: u64,
    pub more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub table: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRangeRequest {
    pub table: String,
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub count: bool,
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRangeResponse {
    pub header: ResponseHeader,
    pub deleted: u64,
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub table: String,
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}
