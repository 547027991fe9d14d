//! Leader Election
//!
//! Implements Raft-style leader election with randomized timeouts to
//! achieve automatic failover when the leader goes down. Terms totally
//! order leaders; votes are granted only to candidates whose log is at
//! least as current as the voter's, which keeps LSNs monotonic across
//! leader changes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::AsyncWriteExt;

use crate::config::WolfKvConfig;
use crate::error::Result;
use crate::network;
use crate::replication::protocol::ControlFrame;
use crate::state::membership::{ClusterMembership, NodeDescriptor};
use crate::wal::Lsn;

/// A newly observed leader id is trusted only after this long of
/// continuous heartbeats carrying it. Dampens churn during contested
/// elections.
pub const EFFECTIVE_LEADER_DEBOUNCE_MS: u64 = 800;

/// Poll interval for the candidate's vote-counting loop
const ELECTION_POLL_MS: u64 = 50;

/// Node role in the election state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl NodeRole {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => NodeRole::Leader,
            1 => NodeRole::Candidate,
            _ => NodeRole::Follower,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            NodeRole::Follower => 0,
            NodeRole::Candidate => 1,
            NodeRole::Leader => 2,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "FOLLOWER"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
            NodeRole::Leader => write!(f, "LEADER"),
        }
    }
}

/// Shared supervisor state. High-frequency fields are atomics so the
/// control listener, monitor, heartbeat loop and role manager can all
/// read them without locking; `election_inflight` guarantees at most
/// one election at a time.
pub struct ClusterState {
    started: Instant,
    current_term: AtomicU64,
    /// Node voted for in the current term (0 = none)
    voted_for: AtomicU32,
    role: AtomicU8,
    /// Leader id from the latest heartbeat (0 = unknown)
    leader_id: AtomicU32,
    /// Debounced leader id the role manager acts on
    effective_leader: AtomicU32,
    /// Since when the same new leader id has been seen (ms, 0 = not tracking)
    leader_seen_since_ms: AtomicU64,
    last_heartbeat_ms: AtomicU64,
    my_last_seq: AtomicU64,
    election_inflight: AtomicBool,
    votes_received: AtomicU32,
    election_term: AtomicU64,
    shutdown: AtomicBool,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            current_term: AtomicU64::new(0),
            voted_for: AtomicU32::new(0),
            role: AtomicU8::new(NodeRole::Follower.as_u8()),
            leader_id: AtomicU32::new(0),
            effective_leader: AtomicU32::new(0),
            leader_seen_since_ms: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(0),
            my_last_seq: AtomicU64::new(0),
            election_inflight: AtomicBool::new(false),
            votes_received: AtomicU32::new(0),
            election_term: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Milliseconds since this supervisor started
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub fn set_role(&self, role: NodeRole) {
        self.role.store(role.as_u8(), Ordering::SeqCst);
    }

    pub fn leader_id(&self) -> u32 {
        self.leader_id.load(Ordering::SeqCst)
    }

    pub fn effective_leader(&self) -> u32 {
        self.effective_leader.load(Ordering::SeqCst)
    }

    pub fn last_heartbeat_age_ms(&self) -> u64 {
        self.now_ms()
            .saturating_sub(self.last_heartbeat_ms.load(Ordering::SeqCst))
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    pub fn my_last_seq(&self) -> Lsn {
        self.my_last_seq.load(Ordering::SeqCst)
    }

    /// Raise the known local log position (never lowers it)
    pub fn note_last_seq(&self, lsn: Lsn) {
        self.my_last_seq.fetch_max(lsn, Ordering::SeqCst);
    }

    /// Reload the local log position, e.g. after a role reset it
    pub fn set_last_seq(&self, lsn: Lsn) {
        self.my_last_seq.store(lsn, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Apply a heartbeat: adopt the term, follow the leader it names,
    /// and debounce the effective leader the role manager acts on.
    pub fn observe_heartbeat(
        &self,
        term: u64,
        leader_id: u32,
        self_id: u32,
        debounce_ms: u64,
    ) {
        let current = self.current_term();
        if term < current {
            return;
        }
        if term > current {
            self.current_term.store(term, Ordering::SeqCst);
            self.voted_for.store(0, Ordering::SeqCst);
        }

        let role = if leader_id == self_id {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        };
        self.set_role(role);
        self.leader_id.store(leader_id, Ordering::SeqCst);
        self.touch_heartbeat();

        let now = self.now_ms().max(1);
        if self.effective_leader() != leader_id {
            let since = self.leader_seen_since_ms.load(Ordering::SeqCst);
            if since == 0 {
                self.leader_seen_since_ms.store(now, Ordering::SeqCst);
            } else if now.saturating_sub(since) >= debounce_ms {
                self.effective_leader.store(leader_id, Ordering::SeqCst);
                self.leader_seen_since_ms.store(0, Ordering::SeqCst);
                tracing::info!("Effective leader is now node {}", leader_id);
            }
        } else {
            self.leader_seen_since_ms.store(0, Ordering::SeqCst);
        }
    }

    /// Decide a vote request per the election rules. Refresh
    /// `my_last_seq` before calling.
    pub fn decide_vote(&self, term: u64, candidate_id: u32, candidate_seq: Lsn) -> bool {
        let current = self.current_term();
        if term > current {
            self.current_term.store(term, Ordering::SeqCst);
            self.voted_for.store(0, Ordering::SeqCst);
            // A higher term deposes leaders and candidates alike
            if self.role() != NodeRole::Follower {
                tracing::info!("Higher term {} observed, stepping down", term);
                self.set_role(NodeRole::Follower);
            }
        }

        if term != self.current_term() {
            return false;
        }

        let voted = self.voted_for.load(Ordering::SeqCst);
        let grant = (voted == 0 || voted == candidate_id) && candidate_seq >= self.my_last_seq();
        if grant {
            self.voted_for.store(candidate_id, Ordering::SeqCst);
        }
        grant
    }

    /// Count a vote response while a matching election is running
    pub fn record_vote_response(&self, term: u64, granted: bool) {
        if granted
            && self.role() == NodeRole::Candidate
            && term == self.election_term.load(Ordering::SeqCst)
        {
            self.votes_received.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Election coordinator: runs candidacies and the leader heartbeat loop
pub struct ElectionCoordinator {
    cluster: Arc<ClusterMembership>,
    state: Arc<ClusterState>,
    heartbeat_interval: Duration,
    heartbeat_timeout_ms: u64,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
}

impl ElectionCoordinator {
    pub fn new(
        cluster: Arc<ClusterMembership>,
        state: Arc<ClusterState>,
        config: &WolfKvConfig,
    ) -> Self {
        Self {
            cluster,
            state,
            heartbeat_interval: Duration::from_millis(config.cluster.heartbeat_interval_ms),
            heartbeat_timeout_ms: config.cluster.heartbeat_timeout_ms,
            election_timeout_min_ms: config.cluster.election_timeout_min_ms,
            election_timeout_max_ms: config.cluster.election_timeout_max_ms,
        }
    }

    /// Heartbeat age after which the leader is presumed dead
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout_ms
    }

    /// Random window a candidate waits for votes
    fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    /// Per-node stagger before the first election, to reduce split
    /// votes at cold start
    pub fn startup_stagger(&self) -> Duration {
        let id = self.cluster.self_id() as u64;
        Duration::from_millis(400 + (id * 123) % 400)
    }

    /// Run one candidacy. Returns immediately if an election is
    /// already in flight.
    pub async fn start_election(&self) {
        let state = &self.state;
        if state
            .election_inflight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let new_term = state.current_term.fetch_add(1, Ordering::SeqCst) + 1;
        state.election_term.store(new_term, Ordering::SeqCst);
        state
            .voted_for
            .store(self.cluster.self_id(), Ordering::SeqCst);
        state.set_role(NodeRole::Candidate);
        state.votes_received.store(1, Ordering::SeqCst); // our own vote

        let quorum = self.cluster.quorum();
        tracing::info!(
            "Starting election for term {} (last_seq={}, nodes={}, required={})",
            new_term,
            state.my_last_seq(),
            self.cluster.len(),
            quorum
        );

        // Single-node cluster wins immediately
        if self.cluster.len() == 1 {
            self.become_leader(new_term).await;
            state.election_inflight.store(false, Ordering::SeqCst);
            return;
        }

        let request = ControlFrame::VoteRequest {
            term: new_term,
            candidate_id: self.cluster.self_id(),
            last_seq: state.my_last_seq(),
        };
        for peer in self.cluster.peers() {
            send_control_frame(peer.clone(), request.clone());
        }

        let deadline = Instant::now() + self.random_election_timeout();
        while Instant::now() < deadline {
            // Stepped down: another leader's heartbeat arrived mid-election
            if state.role() == NodeRole::Follower
                && state.last_heartbeat_age_ms() <= self.heartbeat_timeout_ms
            {
                tracing::info!("Another leader detected during election, reverting to FOLLOWER");
                state.election_inflight.store(false, Ordering::SeqCst);
                return;
            }

            if state.role() == NodeRole::Leader {
                state.election_inflight.store(false, Ordering::SeqCst);
                return;
            }

            let votes = state.votes_received.load(Ordering::SeqCst) as usize;
            if votes >= quorum {
                tracing::info!(
                    "Won election for term {} with {}/{} votes",
                    new_term,
                    votes,
                    self.cluster.len()
                );
                self.become_leader(new_term).await;
                state.election_inflight.store(false, Ordering::SeqCst);
                return;
            }

            tokio::time::sleep(Duration::from_millis(ELECTION_POLL_MS)).await;
        }

        tracing::warn!(
            "Election term {} timed out without majority (votes={}, required={}); no leader",
            new_term,
            state.votes_received.load(Ordering::SeqCst),
            quorum
        );
        state.set_role(NodeRole::Follower);
        state.election_inflight.store(false, Ordering::SeqCst);
    }

    async fn become_leader(&self, term: u64) {
        let state = &self.state;
        let self_id = self.cluster.self_id();

        state.set_role(NodeRole::Leader);
        state.leader_id.store(self_id, Ordering::SeqCst);
        state.effective_leader.store(self_id, Ordering::SeqCst);
        state.leader_seen_since_ms.store(0, Ordering::SeqCst);

        tracing::info!("Became LEADER for term {}", term);

        tokio::spawn(heartbeat_loop(
            Arc::clone(&self.cluster),
            Arc::clone(&self.state),
            self.heartbeat_interval,
        ));

        // Let the first heartbeats propagate before anyone reacts to
        // the role change
        tokio::time::sleep(Duration::from_millis(EFFECTIVE_LEADER_DEBOUNCE_MS)).await;
    }

    /// Handle an incoming vote request and dial the response back to
    /// the candidate's control port
    pub async fn handle_vote_request(&self, term: u64, candidate_id: u32, candidate_seq: Lsn) {
        let granted = self.state.decide_vote(term, candidate_id, candidate_seq);
        if granted {
            tracing::info!("Granting vote to node {} for term {}", candidate_id, term);
        }

        let response = ControlFrame::VoteResponse { term, granted };
        match self.cluster.node(candidate_id) {
            Some(candidate) => send_control_frame(candidate.clone(), response),
            None => tracing::warn!("Vote request from unknown node {}", candidate_id),
        }
    }
}

/// Leader's periodic heartbeat broadcast; exits when deposed
async fn heartbeat_loop(
    cluster: Arc<ClusterMembership>,
    state: Arc<ClusterState>,
    interval: Duration,
) {
    let self_id = cluster.self_id();

    while !state.is_shutdown() && state.role() == NodeRole::Leader {
        let frame = ControlFrame::Heartbeat {
            term: state.current_term(),
            leader_id: self_id,
            last_seq: state.my_last_seq(),
        };

        // Including ourselves keeps our own heartbeat age fresh
        for node in cluster.members() {
            send_control_frame(node.clone(), frame.clone());
        }
        state.touch_heartbeat();

        tokio::time::sleep(interval).await;
    }
    tracing::info!("Heartbeat loop stopped (no longer leader)");
}

/// Fire-and-forget one control frame at a node's control port
fn send_control_frame(node: NodeDescriptor, frame: ControlFrame) {
    tokio::spawn(async move {
        if let Err(e) = send_control_frame_inner(&node, &frame).await {
            tracing::debug!(
                "Control send to node {} ({}) failed: {}",
                node.id,
                node.control_address(),
                e
            );
        }
    });
}

async fn send_control_frame_inner(node: &NodeDescriptor, frame: &ControlFrame) -> Result<()> {
    let mut stream = network::connect(&node.host, node.control_port).await?;
    network::write_all_timed(&mut stream, frame.encode().as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WolfKvConfig;

    fn three_node_state() -> (Arc<ClusterMembership>, Arc<ClusterState>) {
        let config = WolfKvConfig::example(1);
        let cluster = Arc::new(ClusterMembership::from_config(&config).unwrap());
        (cluster, Arc::new(ClusterState::new()))
    }

    #[test]
    fn test_observe_heartbeat_follows_leader() {
        let (_, state) = three_node_state();
        state.observe_heartbeat(3, 2, 1, EFFECTIVE_LEADER_DEBOUNCE_MS);

        assert_eq!(state.current_term(), 3);
        assert_eq!(state.role(), NodeRole::Follower);
        assert_eq!(state.leader_id(), 2);
        // New leader not yet trusted
        assert_eq!(state.effective_leader(), 0);
        assert!(state.last_heartbeat_age_ms() < 100);
    }

    #[test]
    fn test_effective_leader_debounce() {
        let (_, state) = three_node_state();

        // With a zero debounce the second heartbeat confirms the leader
        state.observe_heartbeat(1, 2, 1, 0);
        assert_eq!(state.effective_leader(), 0);
        state.observe_heartbeat(1, 2, 1, 0);
        assert_eq!(state.effective_leader(), 2);

        // A brief burst naming someone else does not displace it
        state.observe_heartbeat(1, 3, 1, 60_000);
        state.observe_heartbeat(1, 3, 1, 60_000);
        assert_eq!(state.effective_leader(), 2);
    }

    #[test]
    fn test_stale_heartbeat_ignored() {
        let (_, state) = three_node_state();
        state.observe_heartbeat(5, 2, 1, 0);
        state.observe_heartbeat(5, 2, 1, 0);

        state.observe_heartbeat(4, 3, 1, 0);
        assert_eq!(state.leader_id(), 2);
        assert_eq!(state.current_term(), 5);
    }

    #[test]
    fn test_heartbeat_naming_self_means_leader() {
        let (_, state) = three_node_state();
        state.observe_heartbeat(2, 1, 1, 0);
        assert_eq!(state.role(), NodeRole::Leader);
    }

    #[test]
    fn test_vote_rules() {
        let (_, state) = three_node_state();
        state.current_term.store(3, Ordering::SeqCst);
        state.set_last_seq(10);

        // Stale term denied
        assert!(!state.decide_vote(2, 2, 100));

        // Candidate behind our log denied
        assert!(!state.decide_vote(3, 2, 9));

        // Up-to-date candidate granted
        assert!(state.decide_vote(3, 2, 10));

        // Same candidate may ask again, a rival may not
        assert!(state.decide_vote(3, 2, 10));
        assert!(!state.decide_vote(3, 3, 99));

        // Higher term resets the vote
        assert!(state.decide_vote(4, 3, 99));
        assert_eq!(state.current_term(), 4);
    }

    #[test]
    fn test_higher_term_vote_request_deposes_leader() {
        let (_, state) = three_node_state();
        state.set_role(NodeRole::Leader);
        state.current_term.store(2, Ordering::SeqCst);

        state.decide_vote(3, 2, 0);
        assert_eq!(state.role(), NodeRole::Follower);
        assert_eq!(state.current_term(), 3);
    }

    #[test]
    fn test_vote_response_counting() {
        let (_, state) = three_node_state();
        state.set_role(NodeRole::Candidate);
        state.election_term.store(5, Ordering::SeqCst);
        state.votes_received.store(1, Ordering::SeqCst);

        state.record_vote_response(5, true);
        assert_eq!(state.votes_received.load(Ordering::SeqCst), 2);

        // Wrong term, denial, or not a candidate: not counted
        state.record_vote_response(4, true);
        state.record_vote_response(5, false);
        state.set_role(NodeRole::Follower);
        state.record_vote_response(5, true);
        assert_eq!(state.votes_received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_immediately() {
        let mut config = WolfKvConfig::example(1);
        config.cluster.members.truncate(1);
        let cluster = Arc::new(ClusterMembership::from_config(&config).unwrap());
        let state = Arc::new(ClusterState::new());
        let coordinator = Arc::new(ElectionCoordinator::new(
            Arc::clone(&cluster),
            Arc::clone(&state),
            &config,
        ));

        coordinator.start_election().await;
        assert_eq!(state.role(), NodeRole::Leader);
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.effective_leader(), 1);

        state.shutdown();
    }
}
