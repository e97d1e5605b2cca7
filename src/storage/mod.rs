//! Table storage: per-table consensus groups, their logs and snapshots,
//! and the engine serving key/value operations on top of them.

pub mod cluster;
pub mod command;
pub mod engine;
pub mod group;
pub mod kv;
pub mod log;
pub mod logreader;
pub mod snapshot;
pub mod state_machine;
pub mod tables;

pub use cluster::{Cluster, Member, StaticCluster};
pub use command::*;
pub use engine::Engine;
pub use group::{ConsensusGroup, GroupStatus};
pub use logreader::LogReader;
pub use state_machine::{Record, StateMachine, TableSnapshot};
pub use tables::{Lease, Table, TableInfo, TableManager, TABLE_SHARD_ID_BASE};
