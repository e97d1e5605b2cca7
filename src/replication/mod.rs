//! Leader-to-follower replication
//!
//! The leader serves committed log ranges and snapshots over HTTP; on a
//! follower the manager runs one worker per table pulling from it.

pub mod client;
pub mod manager;
pub mod server;
pub mod worker;

pub use client::{
    HttpReplicationClient, LocalReplicationClient, ReplicationClient, SnapshotStream,
};
pub use manager::Manager;
pub use server::{maintenance_router, router, serve};
pub use worker::{WorkerContext, WorkerHandle, WorkerState, WorkerStatus};
