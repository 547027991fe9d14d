//! Store Module
//!
//! The narrow contract the replication engine consumes, and the
//! embedded implementation behind it. Any ordered KV engine with a
//! durable per-key apply and a persisted apply position can stand in.

mod kv;

pub use kv::KvStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::wal::{Lsn, WalRecord};

/// Contract between the data-plane roles and the storage engine.
///
/// `execute_log_*` is the LSN serialization point on the leader: it
/// atomically appends to the WAL under a fresh LSN and applies the
/// mutation, so `applied_lsn()` is at least the returned LSN afterwards.
/// `apply_replication` is the follower path: idempotent and monotonic
/// by the record's leader-assigned LSN.
#[async_trait]
pub trait Store: Send + Sync {
    /// Point read
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Up to `limit` pairs with keys >= `start`, ascending
    async fn range_forward(&self, start: &str, limit: usize) -> Result<Vec<(String, String)>>;

    /// Up to `limit` pairs with keys <= `end`, descending
    async fn range_backward(&self, end: &str, limit: usize) -> Result<Vec<(String, String)>>;

    /// Log and apply a SET; returns the assigned LSN
    async fn execute_log_set(&self, key: &str, value: &str) -> Result<Lsn>;

    /// Log and apply a DELETE; returns the assigned LSN
    async fn execute_log_delete(&self, key: &str) -> Result<Lsn>;

    /// Apply a replicated record. A record at or below the current
    /// apply position is a no-op that still reports success.
    async fn apply_replication(&self, record: &WalRecord) -> Result<bool>;

    /// Persisted apply position; survives restarts and WAL truncation
    async fn applied_lsn(&self) -> Lsn;

    /// Records with `lsn > after`, for follower catch-up
    async fn records_since(&self, after: Lsn) -> Result<Vec<WalRecord>>;

    /// Drop all data and log state; the apply position returns to 0
    async fn reset_log_state(&self) -> Result<()>;

    /// Engine compaction plus WAL truncation up to the apply position.
    /// May block for the duration.
    async fn optimize(&self) -> Result<()>;
}
