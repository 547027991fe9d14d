//! WolfKV - Replicated Key-Value Store
//!
//! A Rust-based replicated key-value store built around a segmented
//! Write-Ahead Log (WAL), an ordered on-disk KV engine, and leader-based
//! replication with automatic failover.
//!
//! # Architecture
//!
//! Each cluster member runs one supervisor holding term, vote and role
//! state, plus at most one active data-plane role. The elected leader
//! accepts client writes on its client port, assigns LSNs through the
//! store's WAL, and streams records to followers over a dedicated
//! replication port. Followers apply records idempotently by LSN, serve
//! stale-tolerant reads on a per-node read-only port, and redirect
//! mutating commands to the leader.
//!
//! # Features
//!
//! - Segmented, append-only Write-Ahead Log with LSN-based catch-up
//! - Raft-style leader election with randomized timeouts
//! - Write acknowledgement quorum with configurable timeout policy
//! - Follower read-only ports with client redirects
//! - Cluster status diagnostics over the control plane
//! - HTTP API façade for write and read operations

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod replication;
pub mod state;
pub mod store;
pub mod wal;

pub use config::WolfKvConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::DbClient;
    pub use crate::config::WolfKvConfig;
    pub use crate::error::{Error, Result};
    pub use crate::replication::{FollowerNode, LeaderNode};
    pub use crate::state::{ClusterMembership, ClusterState, NodeRole, Supervisor};
    pub use crate::store::{KvStore, Store};
    pub use crate::wal::{Lsn, Wal, WalOp, WalRecord};
}
