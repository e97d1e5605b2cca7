//! Replication metrics
//!
//! Lock-free counters and gauges, grouped per replicated table, with a
//! Prometheus-compatible text rendering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Counter for tracking monotonically increasing totals
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // saturating, a stray dec never wraps the gauge
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-table replication metrics
#[derive(Debug, Default)]
pub struct TableMetrics {
    /// Last leader log index applied locally
    pub leader_index: Gauge,
    /// Local revision after the last apply
    pub revision: Gauge,
    pub entries_applied: Counter,
    pub snapshots_recovered: Counter,
    pub snapshot_bytes: Counter,
    pub errors: Counter,
}

/// Node-wide replication metrics
#[derive(Debug)]
pub struct ReplicationMetrics {
    tables: Mutex<HashMap<String, Arc<TableMetrics>>>,

    pub workers: Gauge,
    pub recovery_in_flight: Gauge,
    pub reconciliations: Counter,
    pub reconcile_errors: Counter,

    start_time: Instant,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            workers: Gauge::new(),
            recovery_in_flight: Gauge::new(),
            reconciliations: Counter::new(),
            reconcile_errors: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a table
    pub fn table(&self, name: &str) -> Arc<TableMetrics> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TableMetrics::default()))
            .clone()
    }

    /// Forget a table that is no longer replicated
    pub fn remove(&self, name: &str) {
        self.tables.lock().unwrap().remove(name);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        out.push_str("# HELP spokekv_replication_workers Running replication workers\n");
        out.push_str("# TYPE spokekv_replication_workers gauge\n");
        let _ = writeln!(out, "spokekv_replication_workers {}", self.workers.get());

        out.push_str(
            "# HELP spokekv_replication_recovery_in_flight Snapshot transfers in progress\n",
        );
        out.push_str("# TYPE spokekv_replication_recovery_in_flight gauge\n");
        let _ = writeln!(
            out,
            "spokekv_replication_recovery_in_flight {}",
            self.recovery_in_flight.get()
        );

        out.push_str("# HELP spokekv_replication_reconciliations_total Reconcile passes\n");
        out.push_str("# TYPE spokekv_replication_reconciliations_total counter\n");
        let _ = writeln!(
            out,
            "spokekv_replication_reconciliations_total {}",
            self.reconciliations.get()
        );
        let _ = writeln!(
            out,
            "spokekv_replication_reconcile_errors_total {}",
            self.reconcile_errors.get()
        );

        out.push_str("# HELP spokekv_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE spokekv_uptime_seconds gauge\n");
        let _ = writeln!(out, "spokekv_uptime_seconds {}", self.uptime_seconds());

        let tables = self.tables.lock().unwrap();
        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();

        out.push_str("# HELP spokekv_replication_leader_index Last applied leader index\n");
        out.push_str("# TYPE spokekv_replication_leader_index gauge\n");
        for name in &names {
            let _ = writeln!(
                out,
                "spokekv_replication_leader_index{{table=\"{}\"}} {}",
                name,
                tables[*name].leader_index.get()
            );
        }

        out.push_str("# HELP spokekv_replication_revision Local table revision\n");
        out.push_str("# TYPE spokekv_replication_revision gauge\n");
        for name in &names {
            let _ = writeln!(
                out,
                "spokekv_replication_revision{{table=\"{}\"}} {}",
                name,
                tables[*name].revision.get()
            );
        }

        out.push_str("# TYPE spokekv_replication_entries_applied_total counter\n");
        for name in &names {
            let _ = writeln!(
                out,
                "spokekv_replication_entries_applied_total{{table=\"{}\"}} {}",
                name,
                tables[*name].entries_applied.get()
            );
        }

        out.push_str("# TYPE spokekv_replication_snapshots_recovered_total counter\n");
        for name in &names {
            let _ = writeln!(
                out,
                "spokekv_replication_snapshots_recovered_total{{table=\"{}\"}} {}",
                name,
                tables[*name].snapshots_recovered.get()
            );
        }

        out.push_str("# TYPE spokekv_replication_errors_total counter\n");
        for name in &names {
            let _ = writeln!(
                out,
                "spokekv_replication_errors_total{{table=\"{}\"}} {}",
                name,
                tables[*name].errors.get()
            );
        }

        out
    }
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();

        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();

        gauge.set(10);
        gauge.inc();
        assert_eq!(gauge.get(), 11);
        gauge.dec();
        assert_eq!(gauge.get(), 10);

        gauge.set(0);
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = ReplicationMetrics::new();
        metrics.workers.set(2);
        metrics.table("orders").leader_index.set(42);
        metrics.table("users").entries_applied.add(7);

        let out = metrics.to_prometheus();
        assert!(out.contains("spokekv_replication_workers 2"));
        assert!(out.contains("spokekv_replication_leader_index{table=\"orders\"} 42"));
        assert!(out.contains("spokekv_replication_entries_applied_total{table=\"users\"} 7"));

        metrics.remove("orders");
        assert!(!metrics.to_prometheus().contains("orders"));
    }
}
