//! Supervisor / Role Process Manager
//!
//! One supervisor per node. Runs the control-port listener, the
//! follower-timeout monitor and the role manager, and owns at most one
//! data-plane role (leader or follower) at any instant. Role changes
//! terminate the running role before the next one starts, so its
//! sockets and store are released atomically.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::WolfKvConfig;
use crate::error::Result;
use crate::network::{read_line_timed, write_all_timed};
use crate::replication::protocol::ControlFrame;
use crate::replication::LeaderNode;
use crate::state::election::{
    ClusterState, ElectionCoordinator, NodeRole, EFFECTIVE_LEADER_DEBOUNCE_MS,
};
use crate::state::membership::ClusterMembership;
use crate::store::{KvStore, Store};
use crate::replication::FollowerNode;

/// How often the monitor and role manager re-evaluate
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period for a role to stop on its own
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Additional wait after aborting a stuck role task
const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after spawning a role before re-evaluating
const SPAWN_SETTLE: Duration = Duration::from_millis(300);

/// The data-plane role a supervisor wants running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DesiredRole {
    Leader,
    Follower { leader_id: u32 },
}

/// A running data-plane role
struct RoleChild {
    kind: DesiredRole,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

/// Cluster supervisor for one node
pub struct Supervisor {
    config: WolfKvConfig,
    cluster: Arc<ClusterMembership>,
    state: Arc<ClusterState>,
    election: Arc<ElectionCoordinator>,
    child: Mutex<Option<RoleChild>>,
    /// Active role's store, for log-position refreshes
    store_handle: RwLock<Option<Arc<dyn Store>>>,
    /// Active leader role, for CLUSTER_STATUS diagnostics
    leader_handle: RwLock<Option<Arc<LeaderNode>>>,
}

impl Supervisor {
    pub fn new(config: WolfKvConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let cluster = Arc::new(ClusterMembership::from_config(&config)?);
        let state = Arc::new(ClusterState::new());
        let election = Arc::new(ElectionCoordinator::new(
            Arc::clone(&cluster),
            Arc::clone(&state),
            &config,
        ));

        Ok(Arc::new(Self {
            config,
            cluster,
            state,
            election,
            child: Mutex::new(None),
            store_handle: RwLock::new(None),
            leader_handle: RwLock::new(None),
        }))
    }

    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.state)
    }

    pub fn cluster(&self) -> Arc<ClusterMembership> {
        Arc::clone(&self.cluster)
    }

    /// Signal every task to stop
    pub fn shutdown(&self) {
        self.state.shutdown();
    }

    /// Run the supervisor until shutdown is signalled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // Seed the log position before any role opens the store
        {
            let store = KvStore::open(
                &self.config.node.data_dir,
                &self.config.db_name(),
                self.config.wal.segment_max_bytes,
            )?;
            let applied = Store::applied_lsn(&store).await;
            self.state.set_last_seq(applied);
            tracing::info!("Starting supervisor for node {} (applied_lsn={})",
                self.cluster.self_id(), applied);
        }

        let control = Arc::clone(&self);
        let control_task = tokio::spawn(async move { control.control_listener().await });

        let monitor = Arc::clone(&self);
        let monitor_task = tokio::spawn(async move { monitor.follower_monitor().await });

        let manager = Arc::clone(&self);
        let manager_task = tokio::spawn(async move { manager.role_manager().await });

        // Stagger the first election so nodes do not collide at cold start
        tokio::time::sleep(self.election.startup_stagger()).await;
        if !self.state.is_shutdown() {
            self.election.start_election().await;
        }

        while !self.state.is_shutdown() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        tracing::info!("Supervisor shutting down");
        let child = self.child.lock().await.take();
        self.stop_child(child).await;

        control_task.abort();
        monitor_task.abort();
        manager_task.abort();
        Ok(())
    }

    // ---- control plane ----

    async fn control_listener(self: Arc<Self>) {
        let port = self.cluster.self_node().control_port;
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Cannot bind control port {}: {}", port, e);
                self.state.shutdown();
                return;
            }
        };
        tracing::info!("Control listener on port {}", port);

        loop {
            if self.state.is_shutdown() {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let supervisor = Arc::clone(&self);
                            tokio::spawn(async move {
                                supervisor.handle_control_conn(stream).await;
                            });
                        }
                        Err(e) => tracing::error!("Control accept error: {}", e),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// One control frame per connection
    async fn handle_control_conn(self: Arc<Self>, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let line = match read_line_timed(&mut reader).await {
            Ok(Some(line)) if !line.is_empty() => line,
            _ => return,
        };

        let frame = match ControlFrame::parse(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Unknown control message ({}): {}", e, line);
                return;
            }
        };

        match frame {
            ControlFrame::Heartbeat { term, leader_id, .. } => {
                self.state.observe_heartbeat(
                    term,
                    leader_id,
                    self.cluster.self_id(),
                    EFFECTIVE_LEADER_DEBOUNCE_MS,
                );
            }
            ControlFrame::VoteRequest {
                term,
                candidate_id,
                last_seq,
            } => {
                // The vote must compare against the freshest local position
                self.refresh_last_seq().await;
                self.election
                    .handle_vote_request(term, candidate_id, last_seq)
                    .await;
            }
            ControlFrame::VoteResponse { term, granted } => {
                self.state.record_vote_response(term, granted);
            }
            ControlFrame::ClusterStatus => {
                let reply = self.status_reply().await;
                let _ = write_all_timed(&mut write_half, reply.as_bytes()).await;
            }
        }
    }

    /// Build the CLUSTER_STATUS reply
    async fn status_reply(&self) -> String {
        let state = &self.state;
        let mut reply = format!(
            "STATUS {} {} {} {} {} {}\n",
            self.cluster.self_id(),
            state.role(),
            state.current_term(),
            state.effective_leader(),
            state.my_last_seq(),
            state.last_heartbeat_age_ms(),
        );

        if state.role() == NodeRole::Leader {
            if let Some(leader) = self.leader_handle.read().await.clone() {
                for status in leader.follower_status() {
                    reply.push_str(&format!(
                        "FOLLOWER_STATUS {} {} {} {}\n",
                        status.peer,
                        status.acked_upto,
                        if status.alive { 1 } else { 0 },
                        status.last_seen_age_ms,
                    ));
                }
            }
        }

        reply.push_str("END\n");
        reply
    }

    // ---- follower-timeout monitor ----

    async fn follower_monitor(self: Arc<Self>) {
        // Grant the cluster one full timeout before the first alarm
        self.state.touch_heartbeat();

        loop {
            if self.state.is_shutdown() {
                break;
            }

            self.refresh_last_seq().await;

            if self.state.role() != NodeRole::Leader {
                let age = self.state.last_heartbeat_age_ms();
                if age > self.election.heartbeat_timeout_ms() {
                    tracing::warn!("Leader timeout (no heartbeat for {} ms), starting election", age);
                    self.election.start_election().await;
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Authoritative refresh of the local log position from the active
    /// role's store
    async fn refresh_last_seq(&self) {
        let store = self.store_handle.read().await.clone();
        if let Some(store) = store {
            self.state.set_last_seq(store.applied_lsn().await);
        }
    }

    // ---- role manager ----

    async fn role_manager(self: Arc<Self>) {
        loop {
            if self.state.is_shutdown() {
                break;
            }

            let desired = self.desired_role();
            let mut slot = self.child.lock().await;

            let restart = match (slot.as_ref(), desired) {
                (None, Some(_)) => true,
                (Some(child), Some(want)) => child.kind != want || child.handle.is_finished(),
                // No target role yet: leave whatever is running in place
                _ => false,
            };

            if restart {
                let old = slot.take();
                self.stop_child(old).await;

                match self.spawn_child(desired.expect("restart implies a desired role")).await {
                    Ok(child) => {
                        *slot = Some(child);
                        drop(slot);
                        tokio::time::sleep(SPAWN_SETTLE).await;
                        continue;
                    }
                    Err(e) => {
                        // Ports may linger briefly after a stop; retry next tick
                        tracing::error!("Failed to start role: {}", e);
                    }
                }
            }

            drop(slot);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn desired_role(&self) -> Option<DesiredRole> {
        if self.state.role() == NodeRole::Leader {
            return Some(DesiredRole::Leader);
        }
        let effective = self.state.effective_leader();
        if effective != 0 && effective != self.cluster.self_id() {
            return Some(DesiredRole::Follower {
                leader_id: effective,
            });
        }
        None
    }

    /// Graceful stop, then forced abort, then give up loudly
    async fn stop_child(&self, child: Option<RoleChild>) {
        let Some(mut child) = child else { return };

        // Release shared handles so listeners and the store close with
        // the role task
        *self.leader_handle.write().await = None;
        *self.store_handle.write().await = None;

        tracing::info!("Stopping {:?} role", child.kind);
        let _ = child.shutdown.send(true);

        if timeout(GRACEFUL_STOP_TIMEOUT, &mut child.handle).await.is_ok() {
            return;
        }

        tracing::warn!("{:?} role did not stop gracefully, aborting", child.kind);
        child.handle.abort();
        if timeout(FORCED_STOP_TIMEOUT, &mut child.handle).await.is_err() {
            tracing::error!(
                "{:?} role survived forced abort; supervisor continuing",
                child.kind
            );
        }
    }

    async fn spawn_child(&self, desired: DesiredRole) -> Result<RoleChild> {
        let store: Arc<dyn Store> = Arc::new(KvStore::open(
            &self.config.node.data_dir,
            &self.config.db_name(),
            self.config.wal.segment_max_bytes,
        )?);
        self.state.set_last_seq(store.applied_lsn().await);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = match desired {
            DesiredRole::Leader => {
                let leader = LeaderNode::bind(
                    Arc::clone(&store),
                    Arc::clone(&self.state),
                    self.cluster.client_port(),
                    self.cluster.repl_port(),
                    self.config.effective_required_acks(),
                    self.config.cluster.strict_write_quorum,
                )
                .await?;

                *self.leader_handle.write().await = Some(Arc::clone(&leader));
                tokio::spawn(leader.run(shutdown_rx))
            }
            DesiredRole::Follower { leader_id } => {
                let leader_node = self.cluster.node(leader_id).ok_or_else(|| {
                    crate::error::Error::Internal(format!(
                        "no cluster entry for effective leader {}",
                        leader_id
                    ))
                })?;

                let follower = FollowerNode::bind(
                    Arc::clone(&store),
                    Arc::clone(&self.state),
                    leader_node.host.clone(),
                    self.cluster.repl_port(),
                    self.cluster.client_port(),
                    self.cluster.read_port(self.cluster.self_id()),
                )
                .await?;

                tokio::spawn(follower.run(shutdown_rx))
            }
        };

        *self.store_handle.write().await = Some(store);
        Ok(RoleChild {
            kind: desired,
            shutdown: shutdown_tx,
            handle,
        })
    }
}
