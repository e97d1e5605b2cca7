//! Replicated log storage
//!
//! Append-only file of consensus log entries, one file per group.
//! Entry format: [MAGIC][INDEX][TERM][KIND][LEN][PAYLOAD][CRC32]
//!
//! Retained entries are also kept in memory for the log reader. Compaction
//! drops a prefix by rewriting the file; the dropped prefix is covered by a
//! snapshot.

use crate::common::{crc32, Error, Result, WalSyncPolicy};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = *b"SLOG";

/// Kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Group membership, written once at bootstrap
    Membership = 1,
    /// Written by a newly elected leader
    Noop = 2,
    /// Encoded `Command`
    Command = 3,
}

impl TryFrom<u8> for EntryKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EntryKind::Membership),
            2 => Ok(EntryKind::Noop),
            3 => Ok(EntryKind::Command),
            other => Err(Error::Log(format!("Unknown entry kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind,
            payload,
        }
    }
}

/// Log file of one consensus group
pub struct LogStore {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: VecDeque<LogEntry>,
    /// Index just before the first retained entry
    compacted: u64,
    last_term: u64,
    sync_policy: WalSyncPolicy,
}

impl LogStore {
    /// Open or create the log file. `snapshot_index` is the index of the
    /// newest snapshot: entries before it may be kept, but the log must reach
    /// it without a hole.
    ///
    /// A torn or corrupted tail is cut off, everything before it is kept.
    pub fn open(
        path: impl AsRef<Path>,
        snapshot_index: u64,
        sync_policy: WalSyncPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (entries, valid_len) = Self::read_all(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                "Truncating corrupted log tail"
            );
            file.set_len(valid_len)?;
        }

        let mut retained: VecDeque<LogEntry> = VecDeque::with_capacity(entries.len());
        let mut last_term = 0;
        for entry in entries {
            if let Some(prev) = retained.back() {
                if entry.index != prev.index + 1 {
                    return Err(Error::Corrupted(format!(
                        "log {} jumps from index {} to {}",
                        path.display(),
                        prev.index,
                        entry.index
                    )));
                }
            }
            last_term = entry.term;
            retained.push_back(entry);
        }

        let mut stale = false;
        let bounds = retained
            .front()
            .zip(retained.back())
            .map(|(first, last)| (first.index, last.index));
        let compacted = match bounds {
            Some((first, last)) if last >= snapshot_index => {
                if first > snapshot_index + 1 {
                    return Err(Error::Corrupted(format!(
                        "log {} starts at index {}, snapshot ends at {}",
                        path.display(),
                        first,
                        snapshot_index
                    )));
                }
                first - 1
            }
            Some(_) => {
                // crashed after saving a snapshot, before logging past it
                retained.clear();
                stale = true;
                snapshot_index
            }
            None => snapshot_index,
        };

        let mut log = Self {
            path,
            writer: BufWriter::new(file),
            entries: retained,
            compacted,
            last_term,
            sync_policy,
        };
        if stale {
            log.rewrite()?;
        }
        Ok(log)
    }

    /// Read every valid entry and the byte length they span
    fn read_all(path: &Path) -> Result<(Vec<LogEntry>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0u64;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, len))) => {
                    valid_len += len;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Log replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok((entries, valid_len))
    }

    /// Index of the first retained entry
    pub fn first_index(&self) -> u64 {
        self.compacted + 1
    }

    /// Index of the last entry, or the snapshot index when nothing is retained
    pub fn last_index(&self) -> u64 {
        self.compacted + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the next entry, its index must follow `last_index`.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(Error::Log(format!(
                "append of index {} after {}",
                entry.index,
                self.last_index()
            )));
        }

        Self::write_entry(&mut self.writer, &entry)?;
        self.maybe_sync()?;

        self.last_term = entry.term;
        self.entries.push_back(entry);
        Ok(())
    }

    /// Entries in `[from, to]`, at most `max`. `from` below the first retained
    /// index fails with `Compacted`.
    pub fn entries(&self, from: u64, to: u64, max: usize) -> Result<Vec<LogEntry>> {
        if from < self.first_index() {
            return Err(Error::Compacted(self.first_index()));
        }
        let to = to.min(self.last_index());
        if from > to {
            return Ok(Vec::new());
        }

        let start = (from - self.first_index()) as usize;
        let count = ((to - from + 1) as usize).min(max);
        Ok(self.entries.range(start..start + count).cloned().collect())
    }

    /// Drop every entry up to and including `index`
    pub fn compact(&mut self, index: u64) -> Result<()> {
        if index <= self.compacted {
            return Ok(());
        }
        let index = index.min(self.last_index());
        let drop_count = (index - self.compacted) as usize;
        self.entries.drain(..drop_count);
        self.compacted = index;

        self.rewrite()?;
        tracing::debug!(
            path = %self.path.display(),
            compacted = index,
            retained = self.entries.len(),
            "Log compacted"
        );
        Ok(())
    }

    /// Drop everything and continue after `index`, which a snapshot covers
    pub fn reset(&mut self, index: u64) -> Result<()> {
        self.entries.clear();
        self.compacted = index;
        self.rewrite()
    }

    /// Replace the file with the retained entries
    fn rewrite(&mut self) -> Result<()> {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for entry in &self.entries {
                Self::write_entry(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<()> {
        let index = entry.index.to_le_bytes();
        let term = entry.term.to_le_bytes();
        let kind = [entry.kind as u8];
        let len = (entry.payload.len() as u32).to_le_bytes();

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&index)?;
        writer.write_all(&term)?;
        writer.write_all(&kind)?;
        writer.write_all(&len)?;
        writer.write_all(&entry.payload)?;

        let mut checksum_data = Vec::with_capacity(21 + entry.payload.len());
        checksum_data.extend_from_slice(&index);
        checksum_data.extend_from_slice(&term);
        checksum_data.extend_from_slice(&kind);
        checksum_data.extend_from_slice(&len);
        checksum_data.extend_from_slice(&entry.payload);
        writer.write_all(&crc32(&checksum_data).to_le_bytes())?;

        Ok(())
    }

    /// Read a single entry and its encoded length
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(LogEntry, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::Log("Invalid log magic".into()));
        }

        // index, term, kind, len
        let mut header = [0u8; 21];
        reader.read_exact(&mut header)?;
        let index = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
        let term = u64::from_le_bytes(header[8..16].try_into().unwrap_or_default());
        let kind = EntryKind::try_from(header[16])?;
        let len = u32::from_le_bytes(header[17..21].try_into().unwrap_or_default()) as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = Vec::with_capacity(header.len() + len);
        checksum_data.extend_from_slice(&header);
        checksum_data.extend_from_slice(&payload);
        if crc32(&checksum_data) != stored_checksum {
            return Err(Error::Log("Checksum mismatch".into()));
        }

        let encoded_len = (LOG_MAGIC.len() + header.len() + len + 4) as u64;
        Ok(Some((
            LogEntry {
                index,
                term,
                kind,
                payload,
            },
            encoded_len,
        )))
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            WalSyncPolicy::Never => {
                self.writer.flush()?;
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
