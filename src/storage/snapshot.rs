//! Snapshot persistence
//!
//! A snapshot record captures the state machine at a log index so the log
//! prefix up to it can be compacted. With `RecoveryType::Checkpoint` the state
//! is written to a checkpoint file in the table data directory and the record
//! only references it; with `RecoveryType::Snapshot` the record carries the
//! whole key space.
//!
//! Every file uses the same framing: [MAGIC 8B][LEN u64][BLAKE3 32B][PAYLOAD],
//! also used for snapshots shipped to followers.

use crate::common::{Error, RecoveryType, Result};
use crate::storage::state_machine::{StateMachine, TableSnapshot};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const RECORD_MAGIC: &[u8; 8] = b"SPKMETA1";
const STATE_MAGIC: &[u8; 8] = b"SPKSTATE";
const TRANSFER_MAGIC: &[u8; 8] = b"SPKSNAP1";
const HEADER_LEN: usize = 8 + 8 + 32;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Position and membership a snapshot was taken at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    pub members: BTreeMap<u64, String>,
    pub recovery_type: RecoveryType,
}

#[derive(Debug, Serialize, Deserialize)]
enum SnapshotBody {
    Checkpoint { path: PathBuf },
    Inline { state: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    meta: SnapshotMeta,
    body: SnapshotBody,
}

/// Frame a bincode payload with magic, length and BLAKE3 checksum
fn encode_framed<T: Serialize>(magic: &[u8; 8], value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(blake3::hash(&payload).as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_framed<T: DeserializeOwned>(magic: &[u8; 8], bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Corrupted("Snapshot shorter than its header".into()));
    }
    if &bytes[0..8] != magic {
        return Err(Error::Corrupted("Invalid snapshot magic".into()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Corrupted(format!(
            "Snapshot payload is {} bytes, header says {}",
            payload.len(),
            len
        )));
    }
    if blake3::hash(payload).as_bytes() != &bytes[16..48] {
        return Err(Error::Corrupted("Snapshot checksum mismatch".into()));
    }

    Ok(bincode::deserialize(payload)?)
}

/// Encode a snapshot for transfer to a follower
pub fn encode_transfer(snapshot: &TableSnapshot) -> Result<Vec<u8>> {
    encode_framed(TRANSFER_MAGIC, snapshot)
}

/// Decode and verify a transferred snapshot
pub fn decode_transfer(bytes: &[u8]) -> Result<TableSnapshot> {
    decode_framed(TRANSFER_MAGIC, bytes)
}

/// Write through a temporary file so readers never see a partial file
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Snapshots of one consensus group
pub struct SnapshotStore {
    snapshot_dir: PathBuf,
    checkpoint_dir: PathBuf,
    recovery_type: RecoveryType,
}

impl SnapshotStore {
    pub fn new(
        snapshot_dir: impl Into<PathBuf>,
        checkpoint_dir: impl Into<PathBuf>,
        recovery_type: RecoveryType,
    ) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            checkpoint_dir: checkpoint_dir.into(),
            recovery_type,
        }
    }

    /// Persist `state` as the snapshot at `meta.index` and remove older ones
    pub fn save(&self, meta: SnapshotMeta, state: &StateMachine) -> Result<()> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        let index = meta.index;

        let state_bytes = encode_framed(STATE_MAGIC, state)?;
        let body = match self.recovery_type {
            RecoveryType::Checkpoint => {
                std::fs::create_dir_all(&self.checkpoint_dir)?;
                let path = self.checkpoint_path(index);
                write_atomic(&path, &state_bytes)?;
                SnapshotBody::Checkpoint { path }
            }
            RecoveryType::Snapshot => SnapshotBody::Inline { state: state_bytes },
        };

        let record = encode_framed(RECORD_MAGIC, &SnapshotRecord { meta, body })?;
        write_atomic(&self.snapshot_path(index), &record)?;

        self.purge_before(index)?;
        tracing::debug!(
            dir = %self.snapshot_dir.display(),
            index,
            recovery_type = %self.recovery_type,
            "Snapshot saved"
        );
        Ok(())
    }

    /// Load the newest snapshot, if any
    pub fn load_latest(&self) -> Result<Option<(SnapshotMeta, StateMachine)>> {
        let Some(index) = list_indexes(&self.snapshot_dir, SNAPSHOT_PREFIX)?.pop() else {
            return Ok(None);
        };

        let bytes = std::fs::read(self.snapshot_path(index))?;
        let record: SnapshotRecord = decode_framed(RECORD_MAGIC, &bytes)?;

        let state_bytes = match record.body {
            SnapshotBody::Inline { state } => state,
            SnapshotBody::Checkpoint { path } => std::fs::read(&path).map_err(|e| {
                Error::Corrupted(format!("checkpoint {} unreadable: {}", path.display(), e))
            })?,
        };
        let state: StateMachine = decode_framed(STATE_MAGIC, &state_bytes)?;

        if state.revision() != record.meta.index {
            return Err(Error::Corrupted(format!(
                "snapshot {} holds state at revision {}",
                record.meta.index,
                state.revision()
            )));
        }
        Ok(Some((record.meta, state)))
    }

    /// Remove every snapshot and checkpoint
    pub fn remove_all(&self) -> Result<()> {
        for dir in [&self.snapshot_dir, &self.checkpoint_dir] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn purge_before(&self, index: u64) -> Result<()> {
        for old in list_indexes(&self.snapshot_dir, SNAPSHOT_PREFIX)? {
            if old < index {
                std::fs::remove_file(self.snapshot_path(old))?;
            }
        }
        for old in list_indexes(&self.checkpoint_dir, CHECKPOINT_PREFIX)? {
            if old < index {
                std::fs::remove_file(self.checkpoint_path(old))?;
            }
        }
        Ok(())
    }

    fn snapshot_path(&self, index: u64) -> PathBuf {
        self.snapshot_dir
            .join(format!("{}{:020}", SNAPSHOT_PREFIX, index))
    }

    fn checkpoint_path(&self, index: u64) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}{:020}", CHECKPOINT_PREFIX, index))
    }
}

/// Indexes of the files named `<prefix><index>` in `dir`, ascending
fn list_indexes(dir: &Path, prefix: &str) -> Result<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut indexes = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        if let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|n| n.parse::<u64>().ok())
        {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::command::{Command, PutOp};
    use tempfile::tempdir;

    fn state_at(revision: u64) -> StateMachine {
        let mut sm = StateMachine::new();
        for i in 1..=revision {
            let put = Command::Put(PutOp {
                key: format!("key-{}", i).into_bytes(),
                value: b"value".to_vec(),
                prev_kv: false,
            });
            sm.apply(i, Some(&put)).unwrap();
        }
        sm
    }

    fn meta(index: u64, recovery_type: RecoveryType) -> SnapshotMeta {
        SnapshotMeta {
            index,
            term: 2,
            members: BTreeMap::from([(1, "127.0.0.1:5012".to_string())]),
            recovery_type,
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(
            dir.path().join("snap"),
            dir.path().join("data"),
            RecoveryType::Checkpoint,
        );
        assert!(store.load_latest().unwrap().is_none());

        store.save(meta(3, RecoveryType::Checkpoint), &state_at(3)).unwrap();
        store.save(meta(5, RecoveryType::Checkpoint), &state_at(5)).unwrap();

        let (meta, state) = store.load_latest().unwrap().unwrap();
        assert_eq!(meta.index, 5);
        assert_eq!(state.len(), 5);
        assert_eq!(list_indexes(&dir.path().join("data"), CHECKPOINT_PREFIX).unwrap(), vec![5]);
        assert_eq!(list_indexes(&dir.path().join("snap"), SNAPSHOT_PREFIX).unwrap(), vec![5]);
    }

    #[test]
    fn test_inline_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(
            dir.path().join("snap"),
            dir.path().join("data"),
            RecoveryType::Snapshot,
        );
        store.save(meta(4, RecoveryType::Snapshot), &state_at(4)).unwrap();

        let (meta, state) = store.load_latest().unwrap().unwrap();
        assert_eq!(meta.recovery_type, RecoveryType::Snapshot);
        assert_eq!(state.revision(), 4);
        assert!(!dir.path().join("data").exists());

        store.remove_all().unwrap();
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_transfer_detects_corruption() {
        let snapshot = state_at(3).to_snapshot(10001);
        let mut bytes = encode_transfer(&snapshot).unwrap();
        assert_eq!(decode_transfer(&bytes).unwrap(), snapshot);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode_transfer(&bytes), Err(Error::Corrupted(_))));
        assert!(decode_transfer(&bytes[..10]).is_err());
    }
}
