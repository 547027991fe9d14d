//! Leader Node Implementation
//!
//! Handles leader responsibilities: accepting client writes, assigning
//! LSNs through the store, replicating records to followers, and
//! waiting for the acknowledgement quorum.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

use super::protocol::{ClientCommand, ReplicationFrame, CLIENT_USAGE};
use crate::error::{Error, Result};
use crate::network::{length_prefixed, read_line_timed, write_all_timed};
use crate::state::{ClusterState, NodeRole};
use crate::store::Store;
use crate::wal::{Lsn, WalRecord};

/// How long a write waits for its acknowledgement quorum
const ACK_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// One live replication session, owned by the leader while the TCP
/// connection is open. Outbound frames are serialized by the writer
/// mutex so a live broadcast cannot interleave a half-sent catch-up.
pub struct FollowerConnection {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    acked_upto: AtomicU64,
    alive: AtomicBool,
    last_seen_ms: AtomicU64,
}

impl FollowerConnection {
    fn new(peer: SocketAddr, writer: OwnedWriteHalf, now_ms: u64) -> Self {
        Self {
            peer,
            writer: tokio::sync::Mutex::new(writer),
            acked_upto: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn acked_upto(&self) -> Lsn {
        self.acked_upto.load(Ordering::SeqCst)
    }
}

/// Snapshot of one replication session for diagnostics
#[derive(Debug, Clone)]
pub struct FollowerStatus {
    pub peer: String,
    pub acked_upto: Lsn,
    pub alive: bool,
    pub last_seen_age_ms: u64,
}

/// Leader data-plane role: owns the client and replication listeners
/// and the store
pub struct LeaderNode {
    db: Arc<dyn Store>,
    state: Arc<ClusterState>,
    /// Term this leader was elected at; writes are rejected once a
    /// higher term has been observed
    elected_term: u64,
    required_acks: usize,
    strict_quorum: bool,
    client_listener: TcpListener,
    repl_listener: TcpListener,
    followers: Mutex<Vec<Arc<FollowerConnection>>>,
    ack_notify: Notify,
}

impl LeaderNode {
    /// Bind both listeners and construct the role. Pass port 0 to let
    /// the OS choose (used by tests).
    pub async fn bind(
        db: Arc<dyn Store>,
        state: Arc<ClusterState>,
        client_port: u16,
        repl_port: u16,
        required_acks: usize,
        strict_quorum: bool,
    ) -> Result<Arc<Self>> {
        let client_listener = TcpListener::bind(("0.0.0.0", client_port)).await?;
        let repl_listener = TcpListener::bind(("0.0.0.0", repl_port)).await?;
        let elected_term = state.current_term();

        tracing::info!(
            "Leader starting: clients on {}, replication on {}, required_acks={}, term={}",
            client_listener.local_addr()?,
            repl_listener.local_addr()?,
            required_acks,
            elected_term,
        );

        Ok(Arc::new(Self {
            db,
            state,
            elected_term,
            required_acks,
            strict_quorum,
            client_listener,
            repl_listener,
            followers: Mutex::new(Vec::new()),
            ack_notify: Notify::new(),
        }))
    }

    /// Locally bound client address
    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Locally bound replication address
    pub fn repl_addr(&self) -> Result<SocketAddr> {
        Ok(self.repl_listener.local_addr()?)
    }

    /// Store handle (shared with the supervisor for log-position reads)
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.db)
    }

    /// Accept loop for both planes; returns when shutdown is signalled
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut shutdown_rx = shutdown.clone();
        if *shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = self.client_listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let leader = Arc::clone(&self);
                            let session_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = leader.handle_client(stream, session_shutdown).await {
                                    tracing::debug!("Client session {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Client accept error: {}", e),
                    }
                }
                result = self.repl_listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let leader = Arc::clone(&self);
                            let session_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = leader.handle_follower(stream, session_shutdown).await {
                                    tracing::debug!("Replication session {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Replication accept error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Leader stopped");
        Ok(())
    }

    /// Diagnostic snapshot of every replication session
    pub fn follower_status(&self) -> Vec<FollowerStatus> {
        let now = self.state.now_ms();
        self.followers
            .lock()
            .expect("follower list lock")
            .iter()
            .map(|c| FollowerStatus {
                peer: c.peer.to_string(),
                acked_upto: c.acked_upto(),
                alive: c.is_alive(),
                last_seen_age_ms: now.saturating_sub(c.last_seen_ms.load(Ordering::SeqCst)),
            })
            .collect()
    }

    // ---- replication plane ----

    async fn handle_follower(
        &self,
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Session starts with exactly one HELLO
        let hello_line = match read_line_timed(&mut reader).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let hello_lsn = match ReplicationFrame::parse(&hello_line, &mut reader).await {
            Ok(ReplicationFrame::Hello { lsn }) => lsn,
            Ok(other) => {
                tracing::warn!("Follower {} sent {:?} instead of HELLO", peer, other);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Follower {} sent bad HELLO: {}", peer, e);
                return Ok(());
            }
        };

        let conn = Arc::new(FollowerConnection::new(
            peer,
            write_half,
            self.state.now_ms(),
        ));

        // Register and catch up while holding the connection's send
        // lock. A concurrent broadcast either commits its record before
        // the snapshot below (and is streamed here), or blocks on the
        // lock and goes out afterwards with a strictly higher LSN.
        // Either way the session sees every record in ascending order.
        {
            let mut writer = conn.writer.lock().await;
            self.followers
                .lock()
                .expect("follower list lock")
                .push(Arc::clone(&conn));

            tracing::info!("Follower {} connected with HELLO {}", peer, hello_lsn);

            let missing = match self.db.records_since(hello_lsn).await {
                Ok(records) => records,
                Err(e) => {
                    conn.alive.store(false, Ordering::SeqCst);
                    self.remove_follower(&conn);
                    return Err(e);
                }
            };
            for record in &missing {
                let frame = ReplicationFrame::from_record(record).encode();
                if let Err(e) = write_all_timed(&mut *writer, frame.as_bytes()).await {
                    tracing::warn!("Catch-up send to {} failed: {}", peer, e);
                    conn.alive.store(false, Ordering::SeqCst);
                    self.remove_follower(&conn);
                    return Ok(());
                }
            }
            if !missing.is_empty() {
                tracing::info!(
                    "Streamed {} catch-up record(s) to {} (up to LSN {})",
                    missing.len(),
                    peer,
                    missing.last().map(|r| r.lsn).unwrap_or(hello_lsn)
                );
            }
        }

        // ACK intake until the peer goes away
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

            match ReplicationFrame::parse(&line, &mut reader).await {
                Ok(ReplicationFrame::Ack { lsn }) => {
                    conn.acked_upto.fetch_max(lsn, Ordering::SeqCst);
                    conn.last_seen_ms.store(self.state.now_ms(), Ordering::SeqCst);
                    self.ack_notify.notify_waiters();
                }
                Ok(other) => {
                    tracing::warn!("Unexpected frame from follower {}: {:?}", peer, other);
                }
                Err(e) => {
                    // Malformed frame: drop it, keep the session
                    tracing::warn!("Malformed frame from follower {}: {}", peer, e);
                }
            }
        }

        conn.alive.store(false, Ordering::SeqCst);
        self.remove_follower(&conn);
        tracing::info!("Follower {} disconnected", peer);
        Ok(())
    }

    fn remove_follower(&self, conn: &Arc<FollowerConnection>) {
        self.followers
            .lock()
            .expect("follower list lock")
            .retain(|c| !Arc::ptr_eq(c, conn));
    }

    /// Send one record to every live replication session, best effort
    async fn broadcast(&self, record: &WalRecord) {
        let frame = ReplicationFrame::from_record(record).encode();
        let connections: Vec<Arc<FollowerConnection>> = self
            .followers
            .lock()
            .expect("follower list lock")
            .clone();

        for conn in connections {
            if !conn.is_alive() {
                continue;
            }
            let mut writer = conn.writer.lock().await;
            if let Err(e) = write_all_timed(&mut *writer, frame.as_bytes()).await {
                tracing::warn!("Broadcast to {} failed: {}", conn.peer, e);
                conn.alive.store(false, Ordering::SeqCst);
            }
        }
    }

    fn count_acks(&self, lsn: Lsn) -> usize {
        let connections = self.followers.lock().expect("follower list lock");
        count_acked(
            connections.iter().map(|c| (c.is_alive(), c.acked_upto())),
            lsn,
        )
    }

    /// Block until `required_acks` live sessions have acknowledged
    /// `lsn`, or the bounded wait expires
    async fn wait_for_acks(&self, lsn: Lsn) -> Result<usize> {
        if self.required_acks == 0 {
            return Ok(0);
        }

        let deadline = Instant::now() + ACK_WAIT_TIMEOUT;
        loop {
            // Register for wakeups before counting: notify_waiters only
            // reaches registered waiters, so an ack landing between the
            // count and the await must not be lost
            let notified = self.ack_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reached = self.count_acks(lsn);
            if reached >= self.required_acks {
                return Ok(reached);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::QuorumNotReached {
                    reached,
                    required: self.required_acks,
                });
            }

            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    // ---- client plane ----

    async fn handle_client(
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

            let command = match ClientCommand::parse(&line, &mut reader).await {
                Ok(command) => command,
                Err(e) => {
                    tracing::debug!("Bad client command ({}): {}", e, line);
                    write_all_timed(&mut write_half, format!("{}\n", CLIENT_USAGE).as_bytes())
                        .await?;
                    continue;
                }
            };

            self.dispatch(command, &mut write_half).await?;
        }

        Ok(())
    }

    async fn dispatch<W>(&self, command: ClientCommand, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match command {
            ClientCommand::Set { key, value } => {
                self.handle_mutation(writer, WalRecord::set(0, key, value))
                    .await
            }
            ClientCommand::Delete { key } => {
                self.handle_mutation(writer, WalRecord::delete(0, key)).await
            }
            ClientCommand::Get { key } => {
                let reply = match self.db.get(&key).await? {
                    Some(value) => format!("VALUE {}\n", length_prefixed(&value)),
                    None => "NOT_FOUND\n".to_string(),
                };
                write_all_timed(writer, reply.as_bytes()).await
            }
            ClientCommand::RangeForward { start, limit } => {
                let result = self.db.range_forward(&start, limit).await;
                self.write_range_reply(writer, result).await
            }
            ClientCommand::RangeBackward { end, limit } => {
                let result = self.db.range_backward(&end, limit).await;
                self.write_range_reply(writer, result).await
            }
            ClientCommand::Optimize => {
                let reply = match self.db.optimize().await {
                    Ok(()) => "OK_OPTIMIZED\n".to_string(),
                    Err(e) => format!("ERR {}\n", e),
                };
                write_all_timed(writer, reply.as_bytes()).await
            }
        }
    }

    async fn handle_mutation<W>(&self, writer: &mut W, record: WalRecord) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        // A deposed leader must not assign LSNs
        if self.state.role() != NodeRole::Leader
            || self.state.current_term() != self.elected_term
        {
            tracing::warn!(
                "Rejecting write: no longer leader (term {} -> {})",
                self.elected_term,
                self.state.current_term()
            );
            return write_all_timed(writer, b"ERR_NOT_LEADER\n").await;
        }

        let executed = match record.op {
            crate::wal::WalOp::Set => self.db.execute_log_set(&record.key, &record.value).await,
            crate::wal::WalOp::Delete => self.db.execute_log_delete(&record.key).await,
        };

        let lsn = match executed {
            Ok(lsn) => lsn,
            Err(e) => {
                tracing::error!("Write failed for key {}: {}", record.key, e);
                return write_all_timed(writer, b"ERR_WRITE_FAILED\n").await;
            }
        };

        self.state.note_last_seq(lsn);

        let committed = WalRecord { lsn, ..record };
        self.broadcast(&committed).await;

        let reply = match self.wait_for_acks(lsn).await {
            Ok(_) => format!("OK {}\n", lsn),
            Err(e) if self.strict_quorum => {
                tracing::warn!("Write {} rejected: {}", lsn, e);
                "ERR_NO_QUORUM\n".to_string()
            }
            Err(e) => {
                // Leader-durable; followers converge via catch-up
                tracing::warn!("Write {} acknowledged without quorum: {}", lsn, e);
                format!("OK {}\n", lsn)
            }
        };
        write_all_timed(writer, reply.as_bytes()).await
    }

    async fn write_range_reply<W>(
        &self,
        writer: &mut W,
        result: Result<Vec<(String, String)>>,
    ) -> Result<()>
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
}

/// Count sessions that are alive and have acknowledged `lsn`
fn count_acked(statuses: impl Iterator<Item = (bool, Lsn)>, lsn: Lsn) -> usize {
    statuses
        .filter(|(alive, acked)| *alive && *acked >= lsn)
        .count()
}
