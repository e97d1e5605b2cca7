//! Table state machine
//!
//! Ordered key space plus the table revision (index of the last applied log
//! entry) and, on followers, the leader shard and last leader index applied.
//! Every mutation is
//! driven by `apply` in log order, so replicas replaying the same log converge
//! to the same state.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::command::{
    Command, CommandResult, Compare, CompareResult, CompareTarget, DeleteRangeOp,
    DeleteRangeResult, KeyValue, PutOp, PutResult, RangeOp, RangeResult, ReplicateOp,
    ReplicateResult, RequestOp, ResponseOp, TxnOp, TxnResult,
};
use crate::{Error, Result};

/// Stored value and its bookkeeping revisions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
    /// Number of writes since the key was created
    pub version: u64,
}

/// Full content of a table as shipped to a recovering follower
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Shard of the table the snapshot was taken from
    pub shard_id: u64,
    /// Leader log index the snapshot corresponds to
    pub leader_index: u64,
    pub data: BTreeMap<Vec<u8>, Record>,
}

/// Key selection derived from a `(key, range_end)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRange<'a> {
    Single(&'a [u8]),
    /// Every key `>= key`
    From(&'a [u8]),
    All,
    /// Half-open `[key, end)`
    Between(&'a [u8], &'a [u8]),
}

impl<'a> KeyRange<'a> {
    pub fn new(key: &'a [u8], range_end: &'a [u8]) -> Self {
        match (key, range_end) {
            (_, []) => KeyRange::Single(key),
            ([0], [0]) => KeyRange::All,
            (_, [0]) => KeyRange::From(key),
            _ => KeyRange::Between(key, range_end),
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, KeyRange::Single(_))
    }

    /// BTreeMap bounds, `None` when the range is empty
    fn bounds(&self) -> Option<(Bound<&'a [u8]>, Bound<&'a [u8]>)> {
        match *self {
            KeyRange::Single(key) => Some((Bound::Included(key), Bound::Included(key))),
            KeyRange::From(key) => Some((Bound::Included(key), Bound::Unbounded)),
            KeyRange::All => Some((Bound::Unbounded, Bound::Unbounded)),
            KeyRange::Between(key, end) if key < end => {
                Some((Bound::Included(key), Bound::Excluded(end)))
            }
            KeyRange::Between(..) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    data: BTreeMap<Vec<u8>, Record>,
    revision: u64,
    leader_shard_id: u64,
    leader_index: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last applied log entry
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Last leader log index applied through replication, 0 if none
    pub fn leader_index(&self) -> u64 {
        self.leader_index
    }

    /// Leader shard the replicated content came from, 0 if none
    pub fn leader_shard_id(&self) -> u64 {
        self.leader_shard_id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Record> {
        self.data.get(key)
    }

    /// Apply the log entry at `index`. Entries without a command only advance
    /// the revision.
    ///
    /// An index other than `revision + 1` means the log and the state diverged
    /// and is reported as an integrity violation.
    pub fn apply(&mut self, index: u64, command: Option<&Command>) -> Result<CommandResult> {
        self.check_next(index)?;
        self.revision = index;

        Ok(match command {
            None => CommandResult::Empty,
            Some(command) => self.apply_command(command, index),
        })
    }

    /// State holding a leader snapshot, installed as the entry at `revision`
    pub fn from_snapshot(revision: u64, snapshot: TableSnapshot) -> Self {
        Self {
            data: snapshot.data,
            revision,
            leader_shard_id: snapshot.shard_id,
            leader_index: snapshot.leader_index,
        }
    }

    /// Copy of the content for shipping to followers, taken from shard `shard_id`
    pub fn to_snapshot(&self, shard_id: u64) -> TableSnapshot {
        TableSnapshot {
            shard_id,
            leader_index: self.revision,
            data: self.data.clone(),
        }
    }

    fn check_next(&self, index: u64) -> Result<()> {
        if index != self.revision + 1 {
            return Err(Error::Integrity {
                shard: 0,
                reason: format!(
                    "entry {} applied on top of revision {}",
                    index, self.revision
                ),
            });
        }
        Ok(())
    }

    fn apply_command(&mut self, command: &Command, revision: u64) -> CommandResult {
        match command {
            Command::Put(op) => CommandResult::Put(self.put(op, revision)),
            Command::DeleteRange(op) => CommandResult::DeleteRange(self.delete_range(op)),
            Command::Txn(op) => CommandResult::Txn(self.txn(op, revision)),
            Command::Replicate(op) => CommandResult::Replicate(self.replicate(op, revision)),
        }
    }

    /// Apply a batch of leader entries. Entries already applied are skipped; a
    /// batch from another leader shard, or one that does not continue from the
    /// stored leader index, changes nothing.
    fn replicate(&mut self, op: &ReplicateOp, revision: u64) -> ReplicateResult {
        let pending: Vec<_> = op
            .entries
            .iter()
            .filter(|e| e.index > self.leader_index)
            .collect();

        let contiguous = pending
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == self.leader_index + 1 + i as u64);
        if op.shard_id != self.leader_shard_id || !contiguous {
            return ReplicateResult {
                leader_index: self.leader_index,
                applied: 0,
                gap: true,
            };
        }

        for entry in &pending {
            if let Some(command) = &entry.command {
                self.apply_command(command, revision);
            }
            self.leader_index = entry.index;
        }

        ReplicateResult {
            leader_index: self.leader_index,
            applied: pending.len() as u64,
            gap: false,
        }
    }

    fn scan<'a>(
        &'a self,
        range: &KeyRange<'a>,
    ) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Record)> + 'a> {
        match range.bounds() {
            Some(bounds) => Box::new(self.data.range::<[u8], _>(bounds)),
            None => Box::new(std::iter::empty()),
        }
    }

    pub fn range(&self, op: &RangeOp) -> RangeResult {
        let range = KeyRange::new(&op.key, &op.range_end);
        let mut result = RangeResult::default();

        for (key, record) in self.scan(&range) {
            result.count += 1;
            if op.count_only {
                continue;
            }
            if op.limit > 0 && result.kvs.len() as u64 >= op.limit {
                result.more = true;
                continue;
            }
            let value = if op.keys_only {
                Vec::new()
            } else {
                record.value.clone()
            };
            result.kvs.push(KeyValue {
                key: key.clone(),
                value,
            });
        }

        result
    }

    fn put(&mut self, op: &PutOp, revision: u64) -> PutResult {
        let prev = self.data.get(&op.key).cloned();
        let record = match &prev {
            Some(prev) => Record {
                value: op.value.clone(),
                create_revision: prev.create_revision,
                mod_revision: revision,
                version: prev.version + 1,
            },
            None => Record {
                value: op.value.clone(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
            },
        };
        self.data.insert(op.key.clone(), record);

        let prev_kv = if op.prev_kv {
            prev.map(|prev| KeyValue {
                key: op.key.clone(),
                value: prev.value,
            })
        } else {
            None
        };
        PutResult { prev_kv }
    }

    fn delete_range(&mut self, op: &DeleteRangeOp) -> DeleteRangeResult {
        let range = KeyRange::new(&op.key, &op.range_end);
        let keys: Vec<Vec<u8>> = self.scan(&range).map(|(k, _)| k.clone()).collect();

        let mut result = DeleteRangeResult::default();
        let mut deleted = 0;
        for key in keys {
            if let Some(record) = self.data.remove(&key) {
                deleted += 1;
                if op.prev_kv {
                    result.prev_kvs.push(KeyValue {
                        key,
                        value: record.value,
                    });
                }
            }
        }
        if op.count || op.prev_kv {
            result.deleted = deleted;
        }
        result
    }

    fn txn(&mut self, op: &TxnOp, revision: u64) -> TxnResult {
        let succeeded = op.compare.iter().all(|cmp| self.evaluate(cmp));
        let ops = if succeeded { &op.success } else { &op.failure };

        let responses = ops
            .iter()
            .map(|request| match request {
                RequestOp::Range(r) => ResponseOp::Range(self.range(r)),
                RequestOp::Put(p) => ResponseOp::Put(self.put(p, revision)),
                RequestOp::DeleteRange(d) => ResponseOp::DeleteRange(self.delete_range(d)),
            })
            .collect();

        TxnResult {
            succeeded,
            responses,
        }
    }

    /// Evaluate a guard. Over a range every present key must match; an empty
    /// range is judged as a single missing key.
    pub fn evaluate(&self, cmp: &Compare) -> bool {
        let range = KeyRange::new(&cmp.key, &cmp.range_end);
        if range.is_single() {
            return compare_record(cmp, self.data.get(&cmp.key));
        }

        let mut seen = false;
        for (_, record) in self.scan(&range) {
            seen = true;
            if !compare_record(cmp, Some(record)) {
                return false;
            }
        }
        seen || compare_record(cmp, None)
    }
}

fn compare_record(cmp: &Compare, record: Option<&Record>) -> bool {
    // a missing value orders below every present value
    let ordering = match &cmp.target {
        CompareTarget::Value(v) => record.map(|r| r.value.as_slice()).cmp(&Some(v.as_slice())),
        CompareTarget::Version(v) => record.map_or(0, |r| r.version).cmp(v),
        CompareTarget::CreateRevision(v) => record.map_or(0, |r| r.create_revision).cmp(v),
        CompareTarget::ModRevision(v) => record.map_or(0, |r| r.mod_revision).cmp(v),
    };

    match cmp.result {
        CompareResult::Equal => ordering.is_eq(),
        CompareResult::NotEqual => ordering.is_ne(),
        CompareResult::Greater => ordering.is_gt(),
        CompareResult::Less => ordering.is_lt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::command::ReplicatedEntry;

    fn put(key: &str, value: &str) -> Command {
        Command::Put(PutOp {
            key: key.into(),
            value: value.into(),
            prev_kv: true,
        })
    }

    fn seeded() -> StateMachine {
        let mut sm = StateMachine::new();
        sm.apply(1, None).unwrap();
        for (i, (k, v)) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]
            .iter()
            .enumerate()
        {
            sm.apply(i as u64 + 2, Some(&put(k, v))).unwrap();
        }
        sm
    }

    fn range(key: &[u8], range_end: &[u8]) -> RangeOp {
        RangeOp {
            key: key.to_vec(),
            range_end: range_end.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_out_of_order_is_integrity_violation() {
        let mut sm = StateMachine::new();
        sm.apply(1, None).unwrap();

        let err = sm.apply(3, None).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert_eq!(sm.revision(), 1);
    }

    #[test]
    fn test_put_tracks_versions() {
        let mut sm = StateMachine::new();
        sm.apply(1, Some(&put("k", "v1"))).unwrap();
        let res = sm.apply(2, Some(&put("k", "v2"))).unwrap();

        assert_eq!(
            res,
            CommandResult::Put(PutResult {
                prev_kv: Some(KeyValue::new("k", "v1"))
            })
        );
        let record = sm.get(b"k").unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.create_revision, 1);
        assert_eq!(record.mod_revision, 2);
    }

    #[test]
    fn test_range_conventions() {
        let sm = seeded();

        assert_eq!(sm.range(&range(b"b", b"")).kvs, vec![KeyValue::new("b", "2")]);
        assert_eq!(sm.range(&range(b"b", b"d")).count, 2);
        assert_eq!(sm.range(&range(b"b", &[0])).count, 3);
        assert_eq!(sm.range(&range(&[0], &[0])).count, 4);
        // inverted range selects nothing
        assert_eq!(sm.range(&range(b"d", b"a")).count, 0);
    }

    #[test]
    fn test_range_options() {
        let sm = seeded();

        let mut op = range(&[0], &[0]);
        op.limit = 2;
        let res = sm.range(&op);
        assert_eq!(res.kvs.len(), 2);
        assert_eq!(res.count, 4);
        assert!(res.more);

        let mut op = range(&[0], &[0]);
        op.keys_only = true;
        assert!(sm.range(&op).kvs.iter().all(|kv| kv.value.is_empty()));

        let mut op = range(&[0], &[0]);
        op.count_only = true;
        let res = sm.range(&op);
        assert!(res.kvs.is_empty());
        assert_eq!(res.count, 4);
    }

    #[test]
    fn test_delete_range_reporting() {
        let mut sm = seeded();
        let res = sm
            .apply(
                6,
                Some(&Command::DeleteRange(DeleteRangeOp {
                    key: b"a".to_vec(),
                    range_end: b"c".to_vec(),
                    count: false,
                    prev_kv: false,
                })),
            )
            .unwrap();
        assert_eq!(res, CommandResult::DeleteRange(DeleteRangeResult::default()));
        assert_eq!(sm.len(), 2);

        let res = sm
            .apply(
                7,
                Some(&Command::DeleteRange(DeleteRangeOp {
                    key: vec![0],
                    range_end: vec![0],
                    count: true,
                    prev_kv: true,
                })),
            )
            .unwrap();
        assert_eq!(
            res,
            CommandResult::DeleteRange(DeleteRangeResult {
                deleted: 2,
                prev_kvs: vec![KeyValue::new("c", "3"), KeyValue::new("d", "4")],
            })
        );
        assert!(sm.is_empty());
    }

    #[test]
    fn test_compare_missing_key() {
        let sm = seeded();

        assert!(sm.evaluate(&Compare::value("zz", CompareResult::Less, "")));
        assert!(sm.evaluate(&Compare::version("zz", CompareResult::Equal, 0)));
        assert!(sm.evaluate(&Compare::value("a", CompareResult::Greater, "0")));
        assert!(!sm.evaluate(&Compare::value("a", CompareResult::NotEqual, "1")));
    }

    #[test]
    fn test_compare_over_range() {
        let sm = seeded();
        let mut cmp = Compare::version("a", CompareResult::Equal, 1);
        cmp.range_end = vec![0];
        assert!(sm.evaluate(&cmp));

        let mut cmp = Compare::value("a", CompareResult::Less, "3");
        cmp.range_end = b"z".to_vec();
        assert!(!sm.evaluate(&cmp));
    }

    #[test]
    fn test_txn_branches() {
        let mut sm = seeded();
        let txn = TxnOp {
            compare: vec![Compare::value("a", CompareResult::Equal, "1")],
            success: vec![
                RequestOp::Put(PutOp {
                    key: b"a".to_vec(),
                    value: b"10".to_vec(),
                    prev_kv: false,
                }),
                RequestOp::Range(range(b"a", b"")),
            ],
            failure: vec![RequestOp::Range(range(b"b", b""))],
        };

        let res = sm.apply(6, Some(&Command::Txn(txn.clone()))).unwrap();
        let CommandResult::Txn(res) = res else {
            panic!("expected a txn result");
        };
        assert!(res.succeeded);
        assert_eq!(res.responses.len(), 2);
        assert_eq!(
            res.responses[1],
            ResponseOp::Range(RangeResult {
                kvs: vec![KeyValue::new("a", "10")],
                count: 1,
                more: false,
            })
        );

        // the guard no longer holds, failure branch runs
        let CommandResult::Txn(res) = sm.apply(7, Some(&Command::Txn(txn))).unwrap() else {
            panic!("unexpected result");
        };
        assert!(!res.succeeded);
        assert_eq!(sm.revision(), 7);
    }

    fn entry(index: u64, command: Option<Command>) -> ReplicatedEntry {
        ReplicatedEntry { index, command }
    }

    fn batch(shard_id: u64, entries: Vec<ReplicatedEntry>) -> Command {
        Command::Replicate(ReplicateOp { shard_id, entries })
    }

    fn follower_of(shard_id: u64) -> StateMachine {
        StateMachine::from_snapshot(
            1,
            TableSnapshot {
                shard_id,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_replicate_batches() {
        let mut sm = follower_of(10001);
        let entries = vec![entry(1, None), entry(2, Some(put("k", "v")))];
        let res = sm.apply(2, Some(&batch(10001, entries.clone()))).unwrap();
        assert_eq!(
            res,
            CommandResult::Replicate(ReplicateResult {
                leader_index: 2,
                applied: 2,
                gap: false,
            })
        );
        assert_eq!(sm.get(b"k").unwrap().value, b"v");

        // redelivery is skipped
        let res = sm.apply(3, Some(&batch(10001, entries))).unwrap();
        assert!(matches!(res, CommandResult::Replicate(r) if r.applied == 0 && !r.gap));

        let gapped = vec![entry(5, Some(put("x", "y")))];
        let res = sm.apply(4, Some(&batch(10001, gapped))).unwrap();
        assert!(matches!(res, CommandResult::Replicate(r) if r.gap && r.leader_index == 2));
        assert!(sm.get(b"x").is_none());
        assert_eq!(sm.revision(), 4);
    }

    #[test]
    fn test_replicate_from_other_shard_is_gap() {
        let mut sm = follower_of(10001);
        sm.apply(2, Some(&batch(10001, vec![entry(1, None)]))).unwrap();

        // a recreated leader table restarts its indexes under a new shard
        let res = sm
            .apply(3, Some(&batch(10002, vec![entry(2, Some(put("k", "v")))])))
            .unwrap();
        assert!(matches!(res, CommandResult::Replicate(r) if r.gap && r.applied == 0));
        assert!(sm.get(b"k").is_none());
        assert_eq!(sm.leader_index(), 1);
        assert_eq!(sm.leader_shard_id(), 10001);
    }

    #[test]
    fn test_from_snapshot() {
        let leader = seeded();
        let snapshot = leader.to_snapshot(10003);
        assert_eq!(snapshot.leader_index, 5);
        assert_eq!(snapshot.shard_id, 10003);

        let mut follower = StateMachine::from_snapshot(2, snapshot);
        assert_eq!(follower.revision(), 2);
        follower.apply(3, None).unwrap();
        assert_eq!(follower.leader_index(), 5);
        assert_eq!(follower.leader_shard_id(), 10003);
        assert_eq!(follower.len(), 4);
    }
}
