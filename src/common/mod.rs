//! Common utilities and types shared across spokekv

pub mod cert;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod utils;

pub use cert::{Credential, Reloadable};
pub use config::{
    Config, MemberConfig, RaftConfig, RecoveryType, ReplicationConfig, TableConfig, TlsConfig,
    WalSyncPolicy, WorkerConfig,
};
pub use error::{Error, Result};
pub use metrics::{Counter, Gauge, ReplicationMetrics, TableMetrics};
pub use ratelimit::RateLimiter;
pub use utils::{crc32, encode_name, format_bytes, timestamp_now_millis, Backoff};
