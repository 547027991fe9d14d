//! Embedded KV Store
//!
//! `KvStore` pairs the segmented WAL with an embedded SQLite database:
//! an ordered `kv` table for the data and a `meta` row persisting
//! `applied_lsn`. On open, WAL records beyond the persisted apply
//! position are replayed, so the visible state always reflects every
//! record up to `applied_lsn`.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::Store;
use crate::error::Result;
use crate::wal::{Lsn, Wal, WalOp, WalRecord};

struct KvInner {
    conn: Connection,
    wal: Wal,
    applied_lsn: Lsn,
}

/// WAL-backed KV store with a persisted apply position
pub struct KvStore {
    db_name: String,
    inner: Mutex<KvInner>,
}

impl KvStore {
    /// Open (or create) the store under `data_dir`
    pub fn open(data_dir: &Path, db_name: &str, segment_max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(data_dir.join(format!("{}.db", db_name)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key       TEXT PRIMARY KEY,
                value_int INTEGER NOT NULL
            );
            "#,
        )?;

        let applied_lsn = read_applied_lsn(&conn)?;
        let mut wal = Wal::open(data_dir, db_name, segment_max_bytes)?;

        // Truncated segments must not cause old LSNs to be reissued
        wal.advance_seq(applied_lsn);

        let mut inner = KvInner {
            conn,
            wal,
            applied_lsn,
        };
        replay_pending(&mut inner, db_name)?;

        Ok(Self {
            db_name: db_name.to_string(),
            inner: Mutex::new(inner),
        })
    }

    /// Database name this store was opened with
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

fn read_applied_lsn(conn: &Connection) -> Result<Lsn> {
    let lsn: Option<i64> = conn
        .query_row(
            "SELECT value_int FROM meta WHERE key = 'applied_lsn'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(lsn.unwrap_or(0) as Lsn)
}

/// Apply one record and persist the new apply position in a single
/// transaction
fn apply_txn(conn: &mut Connection, record: &WalRecord) -> Result<()> {
    let tx = conn.transaction()?;
    match record.op {
        WalOp::Set => {
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![record.key, record.value],
            )?;
        }
        WalOp::Delete => {
            tx.execute("DELETE FROM kv WHERE key = ?1", params![record.key])?;
        }
    }
    tx.execute(
        "INSERT INTO meta (key, value_int) VALUES ('applied_lsn', ?1)
         ON CONFLICT(key) DO UPDATE SET value_int = ?1",
        params![record.lsn as i64],
    )?;
    tx.commit()?;
    Ok(())
}

/// Replay WAL records beyond the persisted apply position (restart
/// after a crash between WAL flush and engine commit)
fn replay_pending(inner: &mut KvInner, db_name: &str) -> Result<()> {
    let pending = inner.wal.read_from(inner.applied_lsn)?;
    if pending.is_empty() {
        return Ok(());
    }

    tracing::info!(
        "Replaying {} WAL record(s) into {} from LSN {}",
        pending.len(),
        db_name,
        inner.applied_lsn + 1
    );

    for record in pending {
        apply_txn(&mut inner.conn, &record)?;
        inner.applied_lsn = record.lsn;
    }
    Ok(())
}

#[async_trait]
impl Store for KvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        let value = inner
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    async fn range_forward(&self, start: &str, limit: usize) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![start, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn range_backward(&self, end: &str, limit: usize) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "SELECT key, value FROM kv WHERE key <= ?1 ORDER BY key DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![end, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn execute_log_set(&self, key: &str, value: &str) -> Result<Lsn> {
        let mut inner = self.inner.lock().await;
        let lsn = inner.wal.append_set(key, value)?;

        let record = WalRecord::set(lsn, key, value);
        apply_txn(&mut inner.conn, &record)?;
        inner.applied_lsn = lsn;
        Ok(lsn)
    }

    async fn execute_log_delete(&self, key: &str) -> Result<Lsn> {
        let mut inner = self.inner.lock().await;
        let lsn = inner.wal.append_delete(key)?;

        let record = WalRecord::delete(lsn, key);
        apply_txn(&mut inner.conn, &record)?;
        inner.applied_lsn = lsn;
        Ok(lsn)
    }

    async fn apply_replication(&self, record: &WalRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        if record.lsn <= inner.applied_lsn {
            // Already applied: the first record at an LSN wins. A
            // different payload at the same LSN means the cluster has a
            // protocol bug; surface it loudly but stay in sync.
            if let Some(existing) = inner
                .wal
                .read_from(record.lsn.saturating_sub(1))?
                .into_iter()
                .find(|r| r.lsn == record.lsn)
            {
                if existing != *record {
                    tracing::error!(
                        "LSN conflict at {}: applied {}/{:?}, received {}/{:?}; keeping first",
                        record.lsn,
                        existing.key,
                        existing.op,
                        record.key,
                        record.op
                    );
                }
            }
            return Ok(true);
        }

        inner.wal.append_record(record)?;
        apply_txn(&mut inner.conn, record)?;
        inner.applied_lsn = record.lsn;
        Ok(true)
    }

    async fn applied_lsn(&self) -> Lsn {
        self.inner.lock().await.applied_lsn
    }

    async fn records_since(&self, after: Lsn) -> Result<Vec<WalRecord>> {
        let inner = self.inner.lock().await;
        inner.wal.read_from(after)
    }

    async fn reset_log_state(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.wal.clear_all()?;

        let tx = inner.conn.transaction()?;
        tx.execute("DELETE FROM kv", [])?;
        tx.execute(
            "INSERT INTO meta (key, value_int) VALUES ('applied_lsn', 0)
             ON CONFLICT(key) DO UPDATE SET value_int = 0",
            [],
        )?;
        tx.commit()?;

        inner.applied_lsn = 0;
        tracing::warn!("Store {} log state reset", self.db_name);
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let applied = inner.applied_lsn;

        // The meta row survives truncation, so records at or below the
        // apply position are no longer needed for recovery.
        inner.wal.clear_up_to(applied)?;
        inner.conn.execute_batch("VACUUM")?;

        tracing::info!(
            "Store {} optimized; WAL truncated up to LSN {}",
            self.db_name,
            applied
        );
        Ok(())
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").field("db", &self.db_name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SEG: u64 = 5 * 1024 * 1024;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();

        let lsn = store.execute_log_set("a", "foo").await.unwrap();
        assert_eq!(lsn, 1);
        assert_eq!(store.get("a").await.unwrap(), Some("foo".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        assert_eq!(store.execute_log_delete("a").await.unwrap(), 2);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.applied_lsn().await, 2);
    }

    #[tokio::test]
    async fn test_range_scan_boundaries() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            store.execute_log_set(key, key).await.unwrap();
        }

        let forward = store.range_forward("c", 10).await.unwrap();
        let keys: Vec<&str> = forward.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "d", "e"]);

        let backward = store.range_backward("c", 10).await.unwrap();
        let keys: Vec<&str> = backward.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);

        let limited = store.range_forward("a", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_replication_idempotent() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();

        for lsn in 1..=4 {
            store
                .apply_replication(&WalRecord::set(lsn, "k", &format!("v{}", lsn)))
                .await
                .unwrap();
        }
        assert_eq!(store.applied_lsn().await, 4);

        // First apply wins
        assert!(store
            .apply_replication(&WalRecord::set(5, "k", "v5"))
            .await
            .unwrap());
        assert_eq!(store.applied_lsn().await, 5);
        assert_eq!(store.get("k").await.unwrap(), Some("v5".to_string()));

        // Duplicate is a no-op that still reports success
        assert!(store
            .apply_replication(&WalRecord::set(5, "k", "other"))
            .await
            .unwrap());
        assert_eq!(store.applied_lsn().await, 5);
        assert_eq!(store.get("k").await.unwrap(), Some("v5".to_string()));
    }

    #[tokio::test]
    async fn test_applied_lsn_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
            store.execute_log_set("a", "x").await.unwrap();
            store.execute_log_set("b", "y").await.unwrap();
        }

        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
        assert_eq!(store.applied_lsn().await, 2);
        assert_eq!(store.get("b").await.unwrap(), Some("y".to_string()));
        // New mutations continue the sequence
        assert_eq!(store.execute_log_set("c", "z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_replay_catches_up_engine() {
        let dir = tempdir().unwrap();
        {
            let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
            store.execute_log_set("a", "x").await.unwrap();
        }

        // Simulate a crash between WAL flush and engine commit by
        // appending to the WAL behind the engine's back.
        {
            let mut wal = Wal::open(dir.path(), "node1", SEG).unwrap();
            wal.append_set("b", "y").unwrap();
            wal.append_delete("a").unwrap();
        }

        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
        assert_eq!(store.applied_lsn().await, 3);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some("y".to_string()));
    }

    #[tokio::test]
    async fn test_reset_log_state() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
        store.execute_log_set("a", "x").await.unwrap();

        store.reset_log_state().await.unwrap();
        assert_eq!(store.applied_lsn().await, 0);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.records_since(0).await.unwrap().is_empty());

        // Fresh apply stream starts from scratch
        store
            .apply_replication(&WalRecord::set(1, "a", "new"))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_optimize_truncates_wal_not_state() {
        let dir = tempdir().unwrap();
        {
            let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
            for i in 0..5 {
                store
                    .execute_log_set(&format!("k{}", i), "v")
                    .await
                    .unwrap();
            }

            store.optimize().await.unwrap();
            assert!(store.records_since(0).await.unwrap().is_empty());
            assert_eq!(store.applied_lsn().await, 5);

            // New writes continue past the truncated range
            assert_eq!(store.execute_log_set("k5", "v").await.unwrap(), 6);
        }

        // Reopen after truncation: data and sequence both survive
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
        assert_eq!(store.applied_lsn().await, 6);
        assert_eq!(store.get("k0").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.execute_log_set("k7", "v").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_records_since_for_catchup() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();
        store.execute_log_set("a", "x").await.unwrap();
        store.execute_log_set("b", "y").await.unwrap();
        store.execute_log_delete("a").await.unwrap();

        let all = store.records_since(0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].op, WalOp::Delete);

        let tail = store.records_since(2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].lsn, 3);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_without_lsn() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path(), "node1", SEG).unwrap();

        assert!(store.execute_log_set("bad key", "v").await.is_err());
        assert!(store.execute_log_delete("bad|key").await.is_err());
        assert_eq!(store.applied_lsn().await, 0);
        assert_eq!(store.execute_log_set("good", "v").await.unwrap(), 1);
    }
}
