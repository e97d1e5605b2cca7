//! # spokekv
//!
//! A replicated key-value store with one consensus group per table and
//! pull-based leader-to-follower replication.
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │ Leader node                  │
//!            │  Engine: table -> group      │
//!            │  replication API (HTTP)      │
//!            └──────┬────────────────┬──────┘
//!                   │ log / snapshot │
//!        ┌──────────▼─────┐   ┌──────▼─────────┐
//!        │ Follower A     │   │ Follower B     │
//!        │  Manager       │   │  Manager       │
//!        │  worker/table  │   │  worker/table  │
//!        └────────────────┘   └────────────────┘
//! ```
//!
//! Every table is an ordered map of byte keys, written through its own log.
//! The revision of a table is the index of the last applied log entry.
//! Followers apply the leader's committed entries in batches and fall back
//! to a snapshot transfer when the leader has compacted past them.
//!
//! ## Usage
//!
//! ```bash
//! # Leader serving two tables
//! spokekv --config leader.toml leader --table orders --table users
//!
//! # Follower pulling from it
//! SPOKEKV__REPLICATION__LEADER_ADDRESS=http://leader:8444 \
//!   spokekv --config follower.toml follower
//! ```

pub mod common;
pub mod replication;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use replication::Manager;
pub use storage::Engine;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
