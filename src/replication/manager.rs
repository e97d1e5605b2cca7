//! Replication manager
//!
//! Keeps the local table set equal to the leader's and runs one worker per
//! table. Reconciliation happens once at start and then on every
//! `reconcile_interval` tick.

use crate::common::{Config, Error, Result};
use crate::replication::client::ReplicationClient;
use crate::replication::worker::{WorkerContext, WorkerHandle, WorkerStatus};
use crate::storage::tables::TableManager;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct Manager {
    tables: Arc<TableManager>,
    ctx: Arc<WorkerContext>,
    reconcile_interval: Duration,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// Serializes reconcile passes
    reconciling: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        tables: Arc<TableManager>,
        client: Arc<dyn ReplicationClient>,
        config: &Config,
    ) -> Arc<Self> {
        let ctx = WorkerContext::new(
            tables.clone(),
            client,
            config.replication.worker.clone(),
            config.request_timeout(),
        );
        Arc::new(Self {
            tables,
            ctx: Arc::new(ctx),
            reconcile_interval: config.replication.reconcile_interval(),
            workers: Mutex::new(HashMap::new()),
            reconciling: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Start the reconcile loop
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.reconcile().await {
                            manager.ctx.metrics.reconcile_errors.inc();
                            tracing::warn!("Table reconciliation failed: {}", e);
                        }
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(task);
        tracing::info!(
            interval_ms = self.reconcile_interval.as_millis() as u64,
            "Replication manager started"
        );
    }

    /// Align local tables and workers with the leader's table list
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.reconciling.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.ctx.metrics.reconciliations.inc();

        let leader_tables = tokio::time::timeout(
            self.ctx.config.log_rpc_timeout(),
            self.ctx.client.tables(),
        )
        .await??;
        let required: BTreeSet<String> = leader_tables.into_iter().map(|t| t.name).collect();
        let local: BTreeSet<String> = self
            .tables
            .list_tables()?
            .into_iter()
            .map(|t| t.name)
            .collect();

        for name in required.difference(&local) {
            match self.tables.create_table(name).await {
                Ok(info) => tracing::info!(
                    table = %name,
                    shard_id = info.shard_id,
                    "Created table present on leader"
                ),
                Err(Error::TableExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let stale: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().unwrap();
            let names: Vec<String> = workers
                .keys()
                .filter(|name| !required.contains(*name))
                .cloned()
                .collect();
            names.iter().filter_map(|name| workers.remove(name)).collect()
        };
        for handle in stale {
            let name = handle.table().to_string();
            handle.stop().await;
            self.ctx.metrics.remove(&name);
        }

        for name in local.difference(&required) {
            match self.tables.drop_table(name).await {
                Ok(()) => tracing::info!(table = %name, "Dropped table no longer on leader"),
                Err(Error::TableNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut workers = self.workers.lock().unwrap();
        for name in &required {
            let running = workers.get(name).is_some_and(|w| !w.is_finished());
            if !running {
                if workers.contains_key(name) {
                    tracing::warn!(table = %name, "Replication worker exited, restarting");
                }
                let handle = WorkerHandle::spawn(name, self.ctx.clone(), self.cancel.child_token());
                workers.insert(name.clone(), handle);
            }
        }
        self.ctx.metrics.workers.set(workers.len() as u64);

        tracing::debug!(tables = required.len(), "Tables reconciled");
        Ok(())
    }

    /// Status of every worker, sorted by table
    pub fn health(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .workers
            .lock()
            .unwrap()
            .values()
            .map(|w| w.status())
            .collect();
        statuses.sort_by(|a, b| a.table.cmp(&b.table));
        statuses
    }

    /// Prometheus text rendering of the replication metrics
    pub fn metrics(&self) -> String {
        self.ctx.metrics.to_prometheus()
    }

    /// Stop the reconcile loop and every worker
    pub async fn close(&self) {
        self.cancel.cancel();

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Reconcile task failed: {}", e);
            }
        }

        // a pass started before cancellation must finish before draining
        let _guard = self.reconciling.lock().await;
        let workers: Vec<WorkerHandle> = self
            .workers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, w)| w)
            .collect();
        for worker in workers {
            worker.stop().await;
        }
        self.ctx.metrics.workers.set(0);
        tracing::info!("Replication manager stopped");
    }
}
