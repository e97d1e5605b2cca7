//! Consensus group of one table
//!
//! A group owns the table's log, snapshots and state machine. It runs as an
//! actor task: proposals, read-index requests and snapshot installs are
//! serialized through a channel and answered over oneshot replies, so log
//! order and apply order are the same by construction.
//!
//! Leadership requires a quorum of the configured members to be alive in the
//! `Cluster` view. Without a leader every request fails with `Unavailable`,
//! while local (stale) reads keep working from the shared state.

use crate::common::{Error, RecoveryType, Result, WalSyncPolicy};
use crate::storage::cluster::{has_quorum, Cluster};
use crate::storage::command::{Command, CommandResult};
use crate::storage::log::{EntryKind, LogEntry, LogStore};
use crate::storage::snapshot::{SnapshotMeta, SnapshotStore};
use crate::storage::state_machine::{StateMachine, TableSnapshot};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE: usize = 1024;

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub shard_id: u64,
    pub replica_id: u64,
    pub members: BTreeMap<u64, String>,
    /// Log and snapshot records
    pub log_dir: PathBuf,
    /// State machine checkpoints
    pub data_dir: PathBuf,
    pub recovery_type: RecoveryType,
    pub snapshot_entries: u64,
    pub compaction_overhead: u64,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub wal_sync: WalSyncPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatus {
    pub leader_id: Option<u64>,
    pub term: u64,
    pub applied: u64,
    /// Applying stopped after an integrity violation
    pub halted: bool,
}

enum Request {
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<(u64, CommandResult)>>,
    },
    ReadIndex {
        reply: oneshot::Sender<Result<u64>>,
    },
    Install {
        snapshot: TableSnapshot,
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Handle to a running group
pub struct ConsensusGroup {
    shard_id: u64,
    replica_id: u64,
    requests: mpsc::Sender<Request>,
    state: Arc<RwLock<StateMachine>>,
    log: Arc<Mutex<LogStore>>,
    status: watch::Receiver<GroupStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsensusGroup {
    /// Recover the group from disk and start its actor.
    ///
    /// Recovery loads the newest snapshot and replays the log suffix after it.
    /// A group with neither is bootstrapped with a membership entry.
    pub fn start(config: GroupConfig, cluster: Arc<dyn Cluster>) -> Result<Self> {
        let snapshots = SnapshotStore::new(
            config.log_dir.join("snapshots"),
            config.data_dir.clone(),
            config.recovery_type,
        );

        let (snapshot_index, snapshot_term, mut state) = match snapshots.load_latest()? {
            Some((meta, state)) => (meta.index, meta.term, state),
            None => (0, 0, StateMachine::new()),
        };

        let mut log = LogStore::open(config.log_dir.join("log"), snapshot_index, config.wal_sync)?;

        let replay = log.entries(state.revision() + 1, log.last_index(), usize::MAX)?;
        let replayed = replay.len();
        for entry in replay {
            apply_entry(&mut state, &entry).map_err(|e| with_shard(e, config.shard_id))?;
        }

        if log.last_index() == 0 {
            let payload = bincode::serialize(&config.members)?;
            let entry = LogEntry::new(1, 0, EntryKind::Membership, payload);
            log.append(entry.clone())?;
            apply_entry(&mut state, &entry)?;
        }

        let term = log.last_term().max(snapshot_term);
        tracing::info!(
            shard_id = config.shard_id,
            replica_id = config.replica_id,
            snapshot_index,
            replayed,
            revision = state.revision(),
            "Consensus group recovered"
        );

        let applied = state.revision();
        let (status_tx, status) = watch::channel(GroupStatus {
            leader_id: None,
            term,
            applied,
            halted: false,
        });
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let state = Arc::new(RwLock::new(state));
        let log = Arc::new(Mutex::new(log));
        let cancel = CancellationToken::new();

        let actor = GroupActor {
            election_deadline: Instant::now() + randomized(config.election_timeout),
            last_snapshot_index: snapshot_index,
            config: config.clone(),
            cluster,
            state: state.clone(),
            log: log.clone(),
            snapshots,
            status: status_tx,
            term,
            leader: false,
            halted: false,
        };
        let task = tokio::spawn(actor.run(rx, cancel.clone()));

        Ok(Self {
            shard_id: config.shard_id,
            replica_id: config.replica_id,
            requests,
            state,
            log,
            status,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn status(&self) -> GroupStatus {
        *self.status.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.status().leader_id == Some(self.replica_id)
    }

    /// Read the local state without any consensus round
    pub fn read<R>(&self, f: impl FnOnce(&StateMachine) -> R) -> R {
        f(&self.state.read().unwrap())
    }

    /// Run `f` against the group log
    pub fn with_log<R>(&self, f: impl FnOnce(&LogStore) -> R) -> R {
        f(&self.log.lock().unwrap())
    }

    /// Propose a command; resolves once it is committed and applied
    pub async fn propose(&self, command: Command, timeout: Duration) -> Result<(u64, CommandResult)> {
        self.call(timeout, |reply| Request::Propose { command, reply })
            .await
    }

    /// Confirm leadership and return the commit index a linearizable read
    /// must observe
    pub async fn read_index(&self, timeout: Duration) -> Result<u64> {
        self.call(timeout, |reply| Request::ReadIndex { reply }).await
    }

    /// Replace the state with a leader snapshot through the log
    pub async fn install(&self, snapshot: TableSnapshot, timeout: Duration) -> Result<u64> {
        self.call(timeout, |reply| Request::Install { snapshot, reply })
            .await
    }

    async fn call<T>(
        &self,
        timeout: Duration,
        request: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        let round = async {
            self.requests
                .send(request(reply))
                .await
                .map_err(|_| Error::Stopped(self.shard_id))?;
            rx.await.map_err(|_| Error::Stopped(self.shard_id))?
        };

        tokio::time::timeout(timeout, round).await.map_err(|_| {
            Error::Timeout(format!(
                "shard {} did not answer within {:?}",
                self.shard_id, timeout
            ))
        })?
    }

    /// Stop the actor and wait for it to flush the log
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(shard_id = self.shard_id, "Group task failed: {}", e);
            }
        }
    }
}

impl Drop for ConsensusGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn randomized(timeout: Duration) -> Duration {
    let ms = timeout.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(ms..=ms * 2))
}

fn with_shard(error: Error, shard_id: u64) -> Error {
    match error {
        Error::Integrity { reason, .. } => Error::Integrity {
            shard: shard_id,
            reason,
        },
        other => other,
    }
}

/// Apply one log entry to the state machine
fn apply_entry(state: &mut StateMachine, entry: &LogEntry) -> Result<CommandResult> {
    match entry.kind {
        EntryKind::Membership | EntryKind::Noop => state.apply(entry.index, None),
        EntryKind::Command => {
            let command = Command::decode(&entry.payload)?;
            state.apply(entry.index, Some(&command))
        }
    }
}

struct GroupActor {
    config: GroupConfig,
    cluster: Arc<dyn Cluster>,
    state: Arc<RwLock<StateMachine>>,
    log: Arc<Mutex<LogStore>>,
    snapshots: SnapshotStore,
    status: watch::Sender<GroupStatus>,
    term: u64,
    leader: bool,
    halted: bool,
    election_deadline: Instant,
    last_snapshot_index: u64,
}

impl GroupActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(),
                request = rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }

        if self.leader {
            self.cluster.record_leader(self.config.shard_id, None);
        }
        if let Err(e) = self.log.lock().unwrap().sync() {
            tracing::warn!(shard_id = self.config.shard_id, "Log sync on stop failed: {}", e);
        }
        tracing::debug!(shard_id = self.config.shard_id, "Consensus group stopped");
    }

    fn tick(&mut self) {
        if self.halted {
            return;
        }

        let quorum = self.config.members.contains_key(&self.config.replica_id)
            && has_quorum(self.cluster.as_ref(), &self.config.members);

        if self.leader && !quorum {
            tracing::warn!(
                shard_id = self.config.shard_id,
                term = self.term,
                "Quorum lost, stepping down"
            );
            self.leader = false;
            self.election_deadline = Instant::now() + randomized(self.config.election_timeout);
            self.cluster.record_leader(self.config.shard_id, None);
            self.publish();
        } else if !self.leader && quorum && Instant::now() >= self.election_deadline {
            let known = self.cluster.current_leader_for(self.config.shard_id);
            if known.map_or(true, |id| id == self.config.replica_id) {
                self.campaign();
            }
        }
    }

    fn campaign(&mut self) {
        self.term += 1;
        self.leader = true;

        match self.append_and_apply(EntryKind::Noop, Vec::new(), None) {
            Ok((index, _)) => {
                tracing::info!(
                    shard_id = self.config.shard_id,
                    replica_id = self.config.replica_id,
                    term = self.term,
                    index,
                    "Elected leader"
                );
                self.cluster
                    .record_leader(self.config.shard_id, Some(self.config.replica_id));
            }
            Err(e) => {
                tracing::error!(shard_id = self.config.shard_id, "Election failed: {}", e);
                self.leader = false;
                self.election_deadline =
                    Instant::now() + randomized(self.config.election_timeout);
            }
        }
        self.publish();
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Propose { command, reply } => {
                let result = self.ready().and_then(|_| self.propose(&command));
                let _ = reply.send(result);
                self.maybe_snapshot();
            }
            Request::ReadIndex { reply } => {
                let result = self.ready().map(|_| self.state.read().unwrap().revision());
                let _ = reply.send(result);
            }
            Request::Install { snapshot, reply } => {
                let result = self.ready().and_then(|_| self.install(snapshot));
                let _ = reply.send(result);
            }
        }
    }

    /// Requests are only served by a healthy leader
    fn ready(&self) -> Result<()> {
        if self.halted {
            return Err(Error::Integrity {
                shard: self.config.shard_id,
                reason: "group halted after an integrity violation".into(),
            });
        }
        if !self.leader {
            return Err(Error::Unavailable(
                self.config.shard_id,
                "no leader elected".into(),
            ));
        }
        Ok(())
    }

    fn propose(&mut self, command: &Command) -> Result<(u64, CommandResult)> {
        let payload = command.encode()?;
        self.append_and_apply(EntryKind::Command, payload, Some(command))
    }

    fn append_and_apply(
        &mut self,
        kind: EntryKind,
        payload: Vec<u8>,
        command: Option<&Command>,
    ) -> Result<(u64, CommandResult)> {
        let index = {
            let mut log = self.log.lock().unwrap();
            let index = log.last_index() + 1;
            log.append(LogEntry::new(index, self.term, kind, payload))?;
            index
        };

        let applied = self.state.write().unwrap().apply(index, command);
        match applied {
            Ok(result) => {
                self.publish();
                Ok((index, result))
            }
            Err(e) => Err(self.halt(e)),
        }
    }

    fn install(&mut self, snapshot: TableSnapshot) -> Result<u64> {
        let index = self.log.lock().unwrap().last_index() + 1;
        let revision = self.state.read().unwrap().revision();
        if index != revision + 1 {
            return Err(self.halt(Error::Integrity {
                shard: self.config.shard_id,
                reason: format!("log at {} while state is at {}", index - 1, revision),
            }));
        }
        let restored = StateMachine::from_snapshot(index, snapshot);

        // a log behind the saved snapshot is discarded on open, so a crash
        // before the reset recovers the restored state
        self.snapshots.save(self.meta(index), &restored)?;
        self.log.lock().unwrap().reset(index)?;
        *self.state.write().unwrap() = restored;
        self.last_snapshot_index = index;
        self.publish();

        tracing::info!(shard_id = self.config.shard_id, index, "Snapshot installed");
        Ok(index)
    }

    fn meta(&self, index: u64) -> SnapshotMeta {
        SnapshotMeta {
            index,
            term: self.term,
            members: self.config.members.clone(),
            recovery_type: self.config.recovery_type,
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.halted || self.config.snapshot_entries == 0 {
            return;
        }
        let applied = self.state.read().unwrap().revision();
        if applied - self.last_snapshot_index < self.config.snapshot_entries {
            return;
        }

        if let Err(e) = self.snapshot(applied) {
            tracing::warn!(shard_id = self.config.shard_id, "Snapshot failed: {}", e);
        }
    }

    fn snapshot(&mut self, index: u64) -> Result<()> {
        {
            let state = self.state.read().unwrap();
            self.snapshots.save(self.meta(index), &state)?;
        }
        self.last_snapshot_index = index;

        let compact_to = index.saturating_sub(self.config.compaction_overhead);
        self.log.lock().unwrap().compact(compact_to)?;

        tracing::info!(
            shard_id = self.config.shard_id,
            index,
            compacted = compact_to,
            "Snapshot taken"
        );
        Ok(())
    }

    fn halt(&mut self, error: Error) -> Error {
        let error = with_shard(error, self.config.shard_id);
        tracing::error!(
            shard_id = self.config.shard_id,
            "Halting group: {}",
            error
        );
        self.halted = true;
        if self.leader {
            self.leader = false;
            self.cluster.record_leader(self.config.shard_id, None);
        }
        self.publish();
        error
    }

    fn publish(&self) {
        let status = GroupStatus {
            leader_id: self.leader.then_some(self.config.replica_id),
            term: self.term,
            applied: self.state.read().unwrap().revision(),
            halted: self.halted,
        };
        self.status.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cluster::StaticCluster;
    use crate::storage::command::PutOp;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path, members: BTreeMap<u64, String>) -> GroupConfig {
        GroupConfig {
            shard_id: 10001,
            replica_id: 1,
            members,
            log_dir: dir.join("log"),
            data_dir: dir.join("data"),
            recovery_type: RecoveryType::Checkpoint,
            snapshot_entries: 0,
            compaction_overhead: 0,
            election_timeout: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(5),
            wal_sync: WalSyncPolicy::Never,
        }
    }

    fn put(key: &str) -> Command {
        Command::Put(PutOp {
            key: key.into(),
            value: b"v".to_vec(),
            prev_kv: false,
        })
    }

    async fn wait_leader(group: &ConsensusGroup) {
        let mut status = group.status.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while status.borrow().leader_id.is_none() {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_and_elect() {
        let dir = tempdir().unwrap();
        let members = BTreeMap::from([(1, "127.0.0.1:5012".to_string())]);
        let cluster = Arc::new(StaticCluster::new(1, &members));
        let group = ConsensusGroup::start(config(dir.path(), members), cluster.clone()).unwrap();

        wait_leader(&group).await;
        assert!(group.is_leader());
        assert_eq!(cluster.current_leader_for(10001), Some(1));

        let (index, _) = group.propose(put("a"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(index, 3);
        assert_eq!(group.read_index(Duration::from_secs(1)).await.unwrap(), 3);
        group.stop().await;
    }

    #[tokio::test]
    async fn test_no_quorum_is_unavailable() {
        let dir = tempdir().unwrap();
        let members: BTreeMap<u64, String> =
            (1..=3).map(|id| (id, format!("10.0.0.{}:5012", id))).collect();
        let cluster = Arc::new(StaticCluster::new(1, &members));
        let group = ConsensusGroup::start(config(dir.path(), members), cluster.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = group
            .propose(put("a"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(10001, _)));

        // a second member coming up restores the quorum
        cluster.set_alive(2, true);
        wait_leader(&group).await;
        group.propose(put("a"), Duration::from_secs(1)).await.unwrap();

        cluster.set_alive(2, false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!group.is_leader());
        group.stop().await;
    }

    #[tokio::test]
    async fn test_recovers_from_log() {
        let dir = tempdir().unwrap();
        let members = BTreeMap::from([(1, "127.0.0.1:5012".to_string())]);
        let cluster = Arc::new(StaticCluster::new(1, &members));

        {
            let group =
                ConsensusGroup::start(config(dir.path(), members.clone()), cluster.clone())
                    .unwrap();
            wait_leader(&group).await;
            for key in ["a", "b", "c"] {
                group.propose(put(key), Duration::from_secs(1)).await.unwrap();
            }
            group.stop().await;
        }

        let group = ConsensusGroup::start(config(dir.path(), members), cluster).unwrap();
        assert_eq!(group.read(|sm| sm.revision()), 5);
        assert_eq!(group.read(|sm| sm.len()), 3);

        wait_leader(&group).await;
        // new term, new no-op
        assert_eq!(group.status().applied, 6);
        group.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_deadline() {
        let dir = tempdir().unwrap();
        let members = BTreeMap::from([(1, "127.0.0.1:5012".to_string())]);
        let cluster = Arc::new(StaticCluster::new(1, &members));
        let group = ConsensusGroup::start(config(dir.path(), members), cluster).unwrap();
        wait_leader(&group).await;

        // the actor cannot append while the log is held
        let held = group.log.lock().unwrap();
        let err = group
            .propose(put("a"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());
        drop(held);

        // the late proposal still commits, later ones follow it
        let (index, _) = group.propose(put("b"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(index, 4);
        assert_eq!(group.read(|sm| sm.len()), 2);
        group.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_group_rejects_requests() {
        let dir = tempdir().unwrap();
        let members = BTreeMap::from([(1, "127.0.0.1:5012".to_string())]);
        let cluster = Arc::new(StaticCluster::new(1, &members));
        let group = ConsensusGroup::start(config(dir.path(), members), cluster).unwrap();
        group.stop().await;

        let err = group
            .propose(put("a"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stopped(10001)));
    }
}
