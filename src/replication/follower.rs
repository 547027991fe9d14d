//! Follower Node Implementation
//!
//! Handles follower responsibilities: connecting to the leader with
//! backoff, catching up by LSN, applying replicated records
//! idempotently, serving stale-tolerant reads on the read-only port,
//! and redirecting mutating commands to the leader.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::protocol::ReplicationFrame;
use crate::error::{Error, Result};
use crate::network::{self, length_prefixed, read_line_timed, write_all_timed};
use crate::state::ClusterState;
use crate::store::Store;

/// Consecutive non-useful sessions (or failed connects) before the
/// role gives up and lets the supervisor respawn it
const MAX_FAILURES_BEFORE_EXIT: u32 = 5;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Follower data-plane role: owns the store, the replication session
/// to the leader, and the read-only listener
pub struct FollowerNode {
    db: Arc<dyn Store>,
    state: Arc<ClusterState>,
    leader_host: String,
    leader_repl_port: u16,
    /// Client port redirects point at
    leader_client_port: u16,
    read_listener: TcpListener,
}

impl FollowerNode {
    /// Bind the read-only listener and construct the role. Pass read
    /// port 0 to let the OS choose (used by tests).
    pub async fn bind(
        db: Arc<dyn Store>,
        state: Arc<ClusterState>,
        leader_host: String,
        leader_repl_port: u16,
        leader_client_port: u16,
        read_port: u16,
    ) -> Result<Arc<Self>> {
        let read_listener = TcpListener::bind(("0.0.0.0", read_port)).await?;

        tracing::info!(
            "Follower starting: leader {}:{}, read-only on {}",
            leader_host,
            leader_repl_port,
            read_listener.local_addr()?,
        );

        Ok(Arc::new(Self {
            db,
            state,
            leader_host,
            leader_repl_port,
            leader_client_port,
            read_listener,
        }))
    }

    /// Locally bound read-only address
    pub fn read_addr(&self) -> Result<SocketAddr> {
        Ok(self.read_listener.local_addr()?)
    }

    /// Store handle (shared with the supervisor for log-position reads)
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.db)
    }

    /// Run the read-only server and the replication loop; returns an
    /// error when too many consecutive sessions made no progress
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let read_server = Arc::clone(&self);
        let read_shutdown = shutdown.clone();
        let read_task = tokio::spawn(async move {
            read_server.serve_read_only(read_shutdown).await;
        });

        let result = self.sync_with_leader(shutdown).await;
        read_task.abort();
        tracing::info!("Follower stopped");
        result
    }

    // ---- replication ----

    async fn sync_with_leader(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut failures = 0u32;
        let mut backoff = BASE_BACKOFF;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if failures >= MAX_FAILURES_BEFORE_EXIT {
                tracing::error!(
                    "{} consecutive replication failures against {}:{}, giving up",
                    failures,
                    self.leader_host,
                    self.leader_repl_port
                );
                return Err(Error::Replication(
                    "too many consecutive replication failures".into(),
                ));
            }

            let stream = match network::connect(&self.leader_host, self.leader_repl_port).await {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Connect to leader failed ({}), retrying in {:?} (failure {})",
                        e,
                        backoff,
                        failures
                    );
                    sleep_or_shutdown(backoff, &shutdown).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            // Connected: reset backoff before the session
            backoff = BASE_BACKOFF;

            match self.run_session(stream, &shutdown).await {
                Ok(true) => {
                    failures = 0;
                }
                Ok(false) => {
                    failures += 1;
                    tracing::warn!(
                        "Replication session ended without progress (failure {})",
                        failures
                    );
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Replication session error: {} (failure {})", e, failures);
                }
            }

            sleep_or_shutdown(backoff, &shutdown).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One replication session. Returns whether at least one
    /// WRITE/DELETE was received.
    async fn run_session(
        &self,
        stream: TcpStream,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<bool> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let applied = self.db.applied_lsn().await;
        let hello = ReplicationFrame::Hello { lsn: applied };
        write_all_timed(&mut write_half, hello.encode().as_bytes()).await?;
        tracing::info!("Sent HELLO {}", applied);

        let mut useful = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let line = match read_line_timed(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            };
            if line.is_empty() {
                continue;
            }

            let frame = match ReplicationFrame::parse(&line, &mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    // Malformed frame: drop it, keep the session
                    tracing::warn!("Malformed replication frame: {}", e);
                    continue;
                }
            };

            match frame {
                ReplicationFrame::Write { .. } | ReplicationFrame::Delete { .. } => {
                    useful = true;
                    let record = frame.to_record().expect("write/delete carries a record");

                    let applied_now = self.db.applied_lsn().await;
                    let ack_lsn = if record.lsn <= applied_now {
                        // Idempotency: already applied, just re-ack
                        tracing::debug!(
                            "Dropping duplicate record LSN {} (applied {})",
                            record.lsn,
                            applied_now
                        );
                        applied_now
                    } else {
                        if !self.db.apply_replication(&record).await? {
                            tracing::error!("Apply failed for LSN {}", record.lsn);
                            return Ok(useful);
                        }
                        self.state.note_last_seq(record.lsn);
                        record.lsn
                    };

                    let ack = ReplicationFrame::Ack { lsn: ack_lsn };
                    if write_all_timed(&mut write_half, ack.encode().as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ReplicationFrame::ResetWal => {
                    tracing::warn!("Received RESET_WAL from leader, clearing log state");
                    self.db.reset_log_state().await?;
                    self.state.set_last_seq(0);
                    // Resync from scratch on the next session
                    break;
                }
                other => {
                    tracing::warn!("Unexpected frame from leader: {:?}", other);
                }
            }
        }

        Ok(useful)
    }

    // ---- read-only plane ----

    async fn serve_read_only(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut shutdown_rx = shutdown.clone();

        loop {
            tokio::select! {
                result = self.read_listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let follower = Arc::clone(&self);
                            let session_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = follower.handle_read_client(stream, session_shutdown).await {
                                    tracing::debug!("Read-only session {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Read-only accept error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_read_client(
        &self,
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let line = match read_line_timed(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            };
            if line.is_empty() {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["GET", key] => {
                    let reply = match self.db.get(key).await? {
                        Some(value) => format!("VALUE {}\n", length_prefixed(&value)),
                        None => "NOT_FOUND\n".to_string(),
                    };
                    write_all_timed(&mut write_half, reply.as_bytes()).await?;
                }
                ["GETFF", start, limit] => {
                    let result = match limit.parse::<usize>() {
                        Ok(n) => self.db.range_forward(start, n).await,
                        Err(_) => Err(Error::Protocol(format!("invalid scan limit: {}", limit))),
                    };
                    write_range_reply(&mut write_half, result).await?;
                }
                ["GETFB", end, limit] => {
                    let result = match limit.parse::<usize>() {
                        Ok(n) => self.db.range_backward(end, n).await,
                        Err(_) => Err(Error::Protocol(format!("invalid scan limit: {}", limit))),
                    };
                    write_range_reply(&mut write_half, result).await?;
                }
                // Any mutation is steered to the leader, whatever its shape
                ["SET" | "PUT" | "DEL", ..] => {
                    let reply = format!(
                        "REDIRECT {} {}\n",
                        self.leader_host, self.leader_client_port
                    );
                    write_all_timed(&mut write_half, reply.as_bytes()).await?;
                }
                _ => {
                    write_all_timed(&mut write_half, b"ERR_READ_ONLY\n").await?;
                }
            }
        }

        Ok(())
    }
}

async fn write_range_reply<W>(writer: &mut W, result: Result<Vec<(String, String)>>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match result {
        Ok(pairs) => {
            let mut reply = String::new();
            for (key, value) in pairs {
                reply.push_str(&format!("KEY_VALUE {} {}\n", key, length_prefixed(&value)));
            }
            reply.push_str("END\n");
            write_all_timed(writer, reply.as_bytes()).await
        }
        Err(e) => write_all_timed(writer, format!("ERR {}\n", e).as_bytes()).await,
    }
}

/// Sleep that wakes early on shutdown
async fn sleep_or_shutdown(duration: Duration, shutdown: &watch::Receiver<bool>) {
    let mut shutdown_rx = shutdown.clone();
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown_rx.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvStore;
    use crate::wal::WalRecord;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tempfile::tempdir;

    struct TestFollower {
        follower: Arc<FollowerNode>,
        fake_leader: TcpListener,
        shutdown: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    async fn spawn_follower() -> TestFollower {
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(KvStore::open(dir.path(), "node2", 5 * 1024 * 1024).unwrap());

        let fake_leader = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let repl_port = fake_leader.local_addr().unwrap().port();

        let state = Arc::new(ClusterState::new());
        let follower = FollowerNode::bind(
            store,
            state,
            "127.0.0.1".to_string(),
            repl_port,
            7001,
            0,
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = Arc::clone(&follower);
        tokio::spawn(async move {
            let _ = run.run(shutdown_rx).await;
        });

        TestFollower {
            follower,
            fake_leader,
            shutdown: shutdown_tx,
            _dir: dir,
        }
    }

    async fn accept_session(
        listener: &TcpListener,
    ) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half), write_half)
    }

    async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.trim().to_string()
    }

    #[tokio::test]
    async fn test_catchup_apply_and_ack() {
        let harness = spawn_follower().await;
        let (mut reader, mut writer) = accept_session(&harness.fake_leader).await;

        assert_eq!(read_line(&mut reader).await, "HELLO 0");

        writer.write_all(b"WRITE 1 a 1 x\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ACK 1");

        writer.write_all(b"WRITE 2 b 1 y\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ACK 2");

        writer.write_all(b"DELETE 3 a\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ACK 3");

        let db = harness.follower.store();
        assert_eq!(db.get("a").await.unwrap(), None);
        assert_eq!(db.get("b").await.unwrap(), Some("y".to_string()));
        assert_eq!(db.applied_lsn().await, 3);

        let _ = harness.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_duplicate_record_reacked_not_reapplied() {
        let harness = spawn_follower().await;
        let (mut reader, mut writer) = accept_session(&harness.fake_leader).await;
        assert_eq!(read_line(&mut reader).await, "HELLO 0");

        for lsn in 1..=3 {
            writer
                .write_all(format!("WRITE {} k 2 v{}\n", lsn, lsn).as_bytes())
                .await
                .unwrap();
            assert_eq!(read_line(&mut reader).await, format!("ACK {}", lsn));
        }

        // Replayed frame at an applied LSN: no-op, re-acked at the
        // current position
        writer.write_all(b"WRITE 2 k 5 other\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ACK 3");

        assert_eq!(harness.follower.store().applied_lsn().await, 3);

        let _ = harness.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_reset_wal_resyncs_from_scratch() {
        let harness = spawn_follower().await;
        let (mut reader, mut writer) = accept_session(&harness.fake_leader).await;
        assert_eq!(read_line(&mut reader).await, "HELLO 0");

        writer.write_all(b"WRITE 1 a 1 x\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ACK 1");

        writer.write_all(b"RESET_WAL\n").await.unwrap();

        // The session restarts; the new HELLO starts from zero
        let (mut reader2, _writer2) = accept_session(&harness.fake_leader).await;
        assert_eq!(read_line(&mut reader2).await, "HELLO 0");

        let db = harness.follower.store();
        assert_eq!(db.get("a").await.unwrap(), None);
        assert_eq!(db.applied_lsn().await, 0);

        let _ = harness.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_hello_reports_existing_position() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(KvStore::open(dir.path(), "node2", 5 * 1024 * 1024).unwrap());
        store
            .apply_replication(&WalRecord::set(7, "a", "x"))
            .await
            .unwrap();

        let fake_leader = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let repl_port = fake_leader.local_addr().unwrap().port();
        let follower = FollowerNode::bind(
            store,
            Arc::new(ClusterState::new()),
            "127.0.0.1".to_string(),
            repl_port,
            7001,
            0,
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = Arc::clone(&follower);
        tokio::spawn(async move {
            let _ = run.run(shutdown_rx).await;
        });

        let (mut reader, _writer) = accept_session(&fake_leader).await;
        assert_eq!(read_line(&mut reader).await, "HELLO 7");

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_read_only_port_serves_and_redirects() {
        let harness = spawn_follower().await;

        // Seed state directly through the apply path
        let db = harness.follower.store();
        db.apply_replication(&WalRecord::set(1, "a", "foo"))
            .await
            .unwrap();

        let addr = harness.follower.read_addr().unwrap();
        let stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"GET a\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "VALUE 3 foo");

        write_half.write_all(b"GET missing\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "NOT_FOUND");

        write_half.write_all(b"GETFF a 10\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "KEY_VALUE a 3 foo");
        assert_eq!(read_line(&mut reader).await, "END");

        // Mutations are steered to the leader
        write_half.write_all(b"SET a 1 x\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "REDIRECT 127.0.0.1 7001");

        write_half.write_all(b"DEL a\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "REDIRECT 127.0.0.1 7001");

        // Anything else is refused
        write_half.write_all(b"OPTIMIZE\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ERR_READ_ONLY");

        let _ = harness.shutdown.send(true);
    }
}
