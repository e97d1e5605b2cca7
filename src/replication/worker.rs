//! Per-table replication worker
//!
//! A worker owns the replication lease of one local table and keeps it in
//! sync with the leader: it streams committed log entries while it can, and
//! falls back to a full snapshot transfer when the leader compacted past it,
//! the entries do not line up, or the leader table was recreated under a new
//! shard.

use crate::common::{
    format_bytes, Backoff, Error, Gauge, RateLimiter, ReplicationMetrics, Result, TableMetrics,
    WorkerConfig,
};
use crate::replication::client::ReplicationClient;
use crate::storage::command::{Command, CommandResult};
use crate::storage::snapshot::decode_transfer;
use crate::storage::tables::{Table, TableManager};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    AcquiringLease,
    StreamingLog,
    SnapshotRecovering,
    BackingOff,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::AcquiringLease => "acquiring_lease",
            WorkerState::StreamingLog => "streaming_log",
            WorkerState::SnapshotRecovering => "snapshot_recovering",
            WorkerState::BackingOff => "backing_off",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub table: String,
    pub state: WorkerState,
    /// Leader shard the local content came from
    pub leader_shard_id: u64,
    /// Last leader index applied locally
    pub leader_index: u64,
    /// Local revision of the table
    pub revision: u64,
    pub lease_held: bool,
    pub last_error: Option<String>,
}

/// Resources shared by every worker of a node
pub struct WorkerContext {
    pub tables: Arc<TableManager>,
    pub client: Arc<dyn ReplicationClient>,
    pub config: WorkerConfig,
    /// Bounds local proposals and installs
    pub request_timeout: Duration,
    /// Caps concurrent snapshot transfers
    pub recovery: Arc<Semaphore>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<ReplicationMetrics>,
}

impl WorkerContext {
    pub fn new(
        tables: Arc<TableManager>,
        client: Arc<dyn ReplicationClient>,
        config: WorkerConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            recovery: Arc::new(Semaphore::new(config.max_recovery_in_flight)),
            limiter: Arc::new(RateLimiter::new(config.max_snapshot_recv_bytes_per_second)),
            metrics: Arc::new(ReplicationMetrics::new()),
            tables,
            client,
            config,
            request_timeout,
        }
    }
}

/// Handle on a running worker
pub struct WorkerHandle {
    table: String,
    status: watch::Receiver<WorkerStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker for `table`; it stops when `cancel` fires
    pub fn spawn(table: &str, ctx: Arc<WorkerContext>, cancel: CancellationToken) -> Self {
        let (status_tx, status) = watch::channel(WorkerStatus {
            table: table.to_string(),
            state: WorkerState::AcquiringLease,
            leader_shard_id: 0,
            leader_index: 0,
            revision: 0,
            lease_held: false,
            last_error: None,
        });

        let backoff = Backoff::new(
            Duration::from_millis(ctx.config.backoff_base_ms),
            Duration::from_millis(ctx.config.backoff_max_ms),
        );
        let worker = Worker {
            table: table.to_string(),
            owner: uuid::Uuid::new_v4().to_string(),
            metrics: ctx.metrics.table(table),
            ctx,
            cancel: cancel.clone(),
            status: status_tx,
            backoff,
            lease_held: false,
            last_renewal: None,
            last_error: None,
        };
        tracing::info!(table, owner = %worker.owner, "Replication worker started");

        Self {
            table: table.to_string(),
            status,
            cancel,
            task: tokio::spawn(worker.run()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the worker and wait for it to release its lease
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(table = %self.table, "Replication worker failed: {}", e);
        }
    }
}

/// Decrements the gauge when dropped
struct InFlight<'a>(&'a Gauge);

impl<'a> InFlight<'a> {
    fn new(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

struct Worker {
    table: String,
    owner: String,
    ctx: Arc<WorkerContext>,
    metrics: Arc<TableMetrics>,
    cancel: CancellationToken,
    status: watch::Sender<WorkerStatus>,
    backoff: Backoff,
    lease_held: bool,
    last_renewal: Option<Instant>,
    last_error: Option<String>,
}

impl Worker {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut state = WorkerState::AcquiringLease;

        loop {
            self.publish(state);

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.step(state) => result,
            };

            state = match result {
                Ok(next) => {
                    self.last_error = None;
                    next
                }
                Err(e) => {
                    self.metrics.errors.inc();
                    tracing::warn!(
                        table = %self.table,
                        state = %state,
                        attempt = self.backoff.attempts() + 1,
                        "Replication step failed: {}",
                        e
                    );
                    self.last_error = Some(e.to_string());

                    let delay = self.backoff.next_delay();
                    self.publish(WorkerState::BackingOff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state
                }
            };
        }

        if self.lease_held {
            match self.ctx.tables.release_lease(&self.table, &self.owner).await {
                Ok(_) => tracing::debug!(table = %self.table, "Replication lease released"),
                Err(e) => tracing::warn!(
                    table = %self.table,
                    "Failed to release replication lease: {}",
                    e
                ),
            }
            self.lease_held = false;
        }
        self.publish(WorkerState::Stopped);
        tracing::info!(table = %self.table, "Replication worker stopped");
    }

    async fn step(&mut self, state: WorkerState) -> Result<WorkerState> {
        match state {
            WorkerState::AcquiringLease => self.acquire_lease().await,
            WorkerState::StreamingLog => self.stream_log().await,
            WorkerState::SnapshotRecovering => self.recover_snapshot().await,
            WorkerState::BackingOff | WorkerState::Stopped => Ok(WorkerState::AcquiringLease),
        }
    }

    fn local_table(&self) -> Result<Arc<Table>> {
        self.ctx.tables.get_table(&self.table)
    }

    fn publish(&self, state: WorkerState) {
        let (leader_shard_id, leader_index, revision) = self
            .local_table()
            .map(|t| (t.leader_shard_id(), t.leader_index(), t.revision()))
            .unwrap_or_default();
        self.metrics.leader_index.set(leader_index);
        self.metrics.revision.set(revision);

        self.status.send_modify(|status| {
            status.state = state;
            status.leader_shard_id = leader_shard_id;
            status.leader_index = leader_index;
            status.revision = revision;
            status.lease_held = self.lease_held;
            status.last_error = self.last_error.clone();
        });
    }

    /// Take or extend the lease now
    async fn renew_lease(&mut self) -> Result<bool> {
        let held = self
            .ctx
            .tables
            .acquire_lease(&self.table, &self.owner, self.ctx.config.lease_ttl())
            .await?;
        if held {
            self.last_renewal = Some(Instant::now());
        } else if self.lease_held {
            tracing::warn!(table = %self.table, "Replication lease lost");
        }
        self.lease_held = held;
        Ok(held)
    }

    /// Extend the lease once per `lease_interval`
    async fn keep_lease(&mut self) -> Result<bool> {
        let due = self
            .last_renewal
            .map_or(true, |at| at.elapsed() >= self.ctx.config.lease_interval());
        if due || !self.lease_held {
            return self.renew_lease().await;
        }
        Ok(true)
    }

    async fn acquire_lease(&mut self) -> Result<WorkerState> {
        if self.renew_lease().await? {
            let leader_index = self.local_table()?.leader_index();
            tracing::info!(
                table = %self.table,
                owner = %self.owner,
                leader_index,
                "Replication lease acquired"
            );
            return Ok(if leader_index == 0 {
                WorkerState::SnapshotRecovering
            } else {
                WorkerState::StreamingLog
            });
        }

        tracing::debug!(table = %self.table, "Replication lease held elsewhere, waiting");
        self.publish(WorkerState::AcquiringLease);
        tokio::time::sleep(self.ctx.config.lease_interval()).await;
        Ok(WorkerState::AcquiringLease)
    }

    async fn stream_log(&mut self) -> Result<WorkerState> {
        if !self.keep_lease().await? {
            return Ok(WorkerState::AcquiringLease);
        }

        let table = self.local_table()?;
        let leader_index = table.leader_index();
        if leader_index == 0 {
            return Ok(WorkerState::SnapshotRecovering);
        }

        let from = leader_index + 1;
        let fetch = self
            .ctx
            .client
            .log(&self.table, from, self.ctx.config.max_entries_per_call);
        let batch = match tokio::time::timeout(self.ctx.config.log_rpc_timeout(), fetch).await? {
            Ok(batch) => batch,
            Err(Error::Compacted(first_index)) => {
                tracing::info!(
                    table = %self.table,
                    from,
                    first_index,
                    "Leader log compacted, recovering from snapshot"
                );
                return Ok(WorkerState::SnapshotRecovering);
            }
            Err(e) => return Err(e),
        };

        // indexes of a recreated leader table restart, they say nothing about
        // the local content
        let local_shard_id = table.leader_shard_id();
        if batch.shard_id != local_shard_id {
            tracing::info!(
                table = %self.table,
                leader_shard_id = batch.shard_id,
                local_shard_id,
                "Leader table recreated, recovering from snapshot"
            );
            return Ok(WorkerState::SnapshotRecovering);
        }

        if batch.entries.is_empty() {
            self.backoff.reset();
            tokio::time::sleep(self.ctx.config.poll_interval()).await;
            return Ok(WorkerState::StreamingLog);
        }

        // contiguity is checked when the batch is applied
        let fetched = batch.entries.len();
        let (revision, result) = table
            .group()
            .propose(Command::Replicate(batch.into()), self.ctx.request_timeout)
            .await?;

        match result {
            CommandResult::Replicate(result) if result.gap => {
                tracing::warn!(
                    table = %self.table,
                    from,
                    leader_index = result.leader_index,
                    "Replicated batch does not continue local state, recovering from snapshot"
                );
                Ok(WorkerState::SnapshotRecovering)
            }
            CommandResult::Replicate(result) => {
                self.metrics.entries_applied.add(result.applied);
                self.backoff.reset();
                tracing::debug!(
                    table = %self.table,
                    fetched,
                    applied = result.applied,
                    leader_index = result.leader_index,
                    revision,
                    "Applied leader entries"
                );
                Ok(WorkerState::StreamingLog)
            }
            other => Err(Error::Internal(format!(
                "unexpected replicate result: {:?}",
                other
            ))),
        }
    }

    async fn recover_snapshot(&mut self) -> Result<WorkerState> {
        let ctx = self.ctx.clone();
        let _permit = ctx
            .recovery
            .acquire()
            .await
            .map_err(|_| Error::Internal("recovery semaphore closed".into()))?;
        let _in_flight = InFlight::new(&ctx.metrics.recovery_in_flight);

        // the lease may have run out while queued for a permit
        if !self.renew_lease().await? {
            return Ok(WorkerState::AcquiringLease);
        }

        let started = Instant::now();
        let fetched =
            tokio::time::timeout(ctx.config.snapshot_rpc_timeout(), self.fetch_snapshot()).await??;
        let Some(bytes) = fetched else {
            return Ok(WorkerState::AcquiringLease);
        };
        let size = bytes.len();

        let snapshot = tokio::task::spawn_blocking(move || decode_transfer(&bytes))
            .await
            .map_err(|e| Error::Internal(format!("snapshot decoding task failed: {}", e)))??;

        if !self.renew_lease().await? {
            return Ok(WorkerState::AcquiringLease);
        }

        let shard_id = snapshot.shard_id;
        let leader_index = snapshot.leader_index;
        let keys = snapshot.data.len();
        let revision = self
            .local_table()?
            .group()
            .install(snapshot, ctx.request_timeout)
            .await?;

        self.metrics.snapshots_recovered.inc();
        self.metrics.snapshot_bytes.add(size as u64);
        self.backoff.reset();
        tracing::info!(
            table = %self.table,
            leader_shard_id = shard_id,
            leader_index,
            revision,
            keys,
            size = %format_bytes(size as u64),
            throttled = ctx.limiter.is_limited(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot installed"
        );
        Ok(WorkerState::StreamingLog)
    }

    /// Download the leader snapshot, throttled. `None` when the lease was lost
    /// during the transfer.
    async fn fetch_snapshot(&mut self) -> Result<Option<Vec<u8>>> {
        let mut stream = self.ctx.client.snapshot(&self.table).await?;
        let mut buf = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            self.ctx.limiter.acquire(chunk.len()).await;
            buf.extend_from_slice(&chunk);

            if !self.keep_lease().await? {
                return Ok(None);
            }
        }
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_gauge() {
        let gauge = Gauge::new();
        {
            let _a = InFlight::new(&gauge);
            let _b = InFlight::new(&gauge);
            assert_eq!(gauge.get(), 2);
        }
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(WorkerState::SnapshotRecovering.to_string(), "snapshot_recovering");
        assert_eq!(
            serde_json::to_string(&WorkerState::StreamingLog).unwrap(),
            "\"streaming_log\""
        );
    }
}
