//! Replicated-log consensus core. Nodes elect a leader with randomized
//! timeouts, the leader serializes submitted commands into its log and fans
//! them out to followers, and an index is committed once a majority holds it
//! at the leader's current term.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub mod apply;
pub mod persist;
pub mod rpc;
pub mod server;

pub use apply::Applicator;
use persist::{PersistentState, StateFile};
use rpc::{AppendEntries, AppendResponse, Message, RequestVote, VoteResponse};

use crate::config::Config;
use crate::error::Result;

/// Client-facing address of a node, carried in leader hints and redirects.
pub type ClientAddr = (String, u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    /// Opaque to consensus; only the applicator interprets it.
    pub command: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Durably replicated on a majority at the leader's term.
    Committed(i64),
    /// Deadline elapsed. The entry stays in the log and may still commit
    /// through later heartbeats.
    NotCommitted,
    /// This node is not the leader; the hint is the leader's client address
    /// when one is known.
    NotLeader(Option<ClientAddr>),
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: Role,
    pub term: u64,
    pub commit_index: i64,
    pub last_applied: i64,
    pub log_length: usize,
    pub leader: Option<ClientAddr>,
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Timing {
    heartbeat_interval: Duration,
    election_timeout: (Duration, Duration),
    rpc_timeout: Duration,
    submit_timeout: Duration,
}

struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
    commit_index: i64,
    last_applied: i64,
    leader_hint: Option<ClientAddr>,
    // Leader-only, cleared on step-down.
    next_index: HashMap<String, i64>,
    match_index: HashMap<String, i64>,
    election_deadline: Instant,
    /// Set when a persistence write failed; durability can no longer be
    /// assumed after a crash.
    degraded: bool,
}

enum ReplicateStep {
    /// Peer acknowledged entries up to this index.
    Matched(i64),
    /// Consistency check failed at the peer; next_index was decremented.
    Conflict,
    SteppedDown,
    Unreachable,
}

#[derive(Clone)]
pub struct RaftNode {
    id: String,
    host: String,
    consensus_port: u16,
    client_addr: ClientAddr,
    peers: Vec<String>,
    timing: Timing,
    state: Arc<Mutex<RaftState>>,
    state_file: Option<Arc<StateFile>>,
    applicator: Option<Arc<dyn Applicator>>,
    apply_notify: Arc<Notify>,
    election_reset: Arc<Notify>,
    commit_tx: Arc<watch::Sender<i64>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    started_at: DateTime<Utc>,
}

impl RaftNode {
    pub async fn new(config: &Config, applicator: Option<Arc<dyn Applicator>>) -> Result<RaftNode> {
        let state_file = config
            .raft
            .persist_dir
            .as_ref()
            .map(|dir| Arc::new(StateFile::new(dir)));

        let persisted = match &state_file {
            Some(file) => {
                let loaded = file.load().await?;
                if loaded.current_term > 0 || !loaded.log.is_empty() {
                    info!(
                        term = loaded.current_term,
                        log_length = loaded.log.len(),
                        "loaded persisted raft state"
                    );
                }
                loaded
            }
            None => PersistentState::default(),
        };

        let timing = Timing {
            heartbeat_interval: config.heartbeat_interval(),
            election_timeout: config.election_timeout_range(),
            rpc_timeout: config.rpc_timeout(),
            submit_timeout: config.submit_timeout(),
        };
        let initial_deadline = Instant::now() + random_timeout(timing.election_timeout);

        let (commit_tx, _) = watch::channel(-1);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(RaftNode {
            id: config.node_id(),
            host: config.node.host.clone(),
            consensus_port: config.node.consensus_port,
            client_addr: config.client_addr(),
            peers: config.node.peers.clone(),
            timing,
            state: Arc::new(Mutex::new(RaftState {
                role: Role::Follower,
                current_term: persisted.current_term,
                voted_for: persisted.voted_for,
                log: persisted.log,
                commit_index: -1,
                last_applied: -1,
                leader_hint: None,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline: initial_deadline,
                degraded: false,
            })),
            state_file,
            applicator,
            apply_notify: Arc::new(Notify::new()),
            election_reset: Arc::new(Notify::new()),
            commit_tx: Arc::new(commit_tx),
            shutdown_tx: Arc::new(shutdown_tx),
            started_at: Utc::now(),
        })
    }

    /// Binds the consensus listener and spawns the election timer and apply
    /// pipeline. Runs until [`RaftNode::stop`].
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.consensus_port)).await?;
        info!(id = %self.id, addr = %listener.local_addr()?, "consensus listener up");
        tokio::spawn(server::run(self.clone(), listener));

        let node = self.clone();
        tokio::spawn(async move { node.run_election_timer().await });
        let node = self.clone();
        tokio::spawn(apply::run(node));
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.apply_notify.notify_one();
        self.election_reset.notify_one();
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    pub async fn leader_hint(&self) -> Option<ClientAddr> {
        self.state.lock().await.leader_hint.clone()
    }

    pub async fn status(&self) -> NodeStatus {
        let st = self.state.lock().await;
        NodeStatus {
            node_id: self.id.clone(),
            role: st.role,
            term: st.current_term,
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            log_length: st.log.len(),
            leader: st.leader_hint.clone(),
            degraded: st.degraded,
            started_at: self.started_at,
        }
    }

    /// Appends a command to the replicated log and waits for a majority to
    /// acknowledge it, up to the submit deadline.
    pub async fn submit(&self, command: Value) -> SubmitOutcome {
        let (my_index, term, doc) = {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return SubmitOutcome::NotLeader(st.leader_hint.clone());
            }
            let term = st.current_term;
            st.log.push(LogEntry { term, command });
            let my_index = st.log.len() as i64 - 1;
            (my_index, term, self.snapshot_locked(&st))
        };
        // Local append must be durable before replication acknowledges it.
        self.persist(doc).await;

        // A single-node cluster has its majority already.
        {
            let mut st = self.state.lock().await;
            if st.role == Role::Leader && st.current_term == term {
                self.advance_commit_locked(&mut st);
            }
        }

        let deadline = Instant::now() + self.timing.submit_timeout;
        for peer in self.peers.clone() {
            let node = self.clone();
            tokio::spawn(async move { node.replicate_until(peer, my_index, term, deadline).await });
        }

        let mut commits = self.commit_tx.subscribe();
        loop {
            if *commits.borrow() >= my_index {
                // Committing past our index only counts if our entry survived.
                let st = self.state.lock().await;
                let intact = st.log.get(my_index as usize).map(|e| e.term) == Some(term);
                return if intact {
                    SubmitOutcome::Committed(my_index)
                } else {
                    SubmitOutcome::NotCommitted
                };
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return SubmitOutcome::NotCommitted;
            };
            match tokio::time::timeout(remaining, commits.changed()).await {
                Ok(Ok(())) => continue,
                _ => return SubmitOutcome::NotCommitted,
            }
        }
    }

    // ---- RPC handlers -----------------------------------------------------

    pub(crate) async fn handle_request_vote(&self, req: RequestVote) -> VoteResponse {
        let (response, doc) = {
            let mut st = self.state.lock().await;
            let mut changed = false;

            if req.term > st.current_term {
                self.step_down_locked(&mut st, req.term);
                changed = true;
            }
            if req.term < st.current_term {
                return VoteResponse {
                    term: st.current_term,
                    vote_granted: false,
                };
            }

            let our_last_index = st.log.len() as i64 - 1;
            let our_last_term = st.log.last().map(|e| e.term).unwrap_or(0);
            // Grant only to candidates whose log is at least as up to date.
            let log_ok = req.last_log_term > our_last_term
                || (req.last_log_term == our_last_term && req.last_log_index >= our_last_index);
            let free_to_vote = st.voted_for.is_none()
                || st.voted_for.as_deref() == Some(req.candidate_id.as_str());
            let vote_granted = free_to_vote && log_ok;

            if vote_granted {
                st.voted_for = Some(req.candidate_id.clone());
                self.reset_election_deadline_locked(&mut st);
                changed = true;
            }
            debug!(
                term = st.current_term,
                candidate = %req.candidate_id,
                vote_granted,
                "handled vote request"
            );
            let doc = changed.then(|| self.snapshot_locked(&st));
            (
                VoteResponse {
                    term: st.current_term,
                    vote_granted,
                },
                doc,
            )
        };
        // The grant must be durable before the candidate can count it.
        if let Some(doc) = doc {
            self.persist(doc).await;
        }
        response
    }

    pub(crate) async fn handle_append_entries(&self, req: AppendEntries) -> AppendResponse {
        let (response, doc) = {
            let mut st = self.state.lock().await;
            if req.term < st.current_term {
                return AppendResponse {
                    term: st.current_term,
                    success: false,
                    last_index: None,
                };
            }

            let mut changed = false;
            if req.term > st.current_term {
                st.current_term = req.term;
                st.voted_for = None;
                changed = true;
            }
            if st.role != Role::Follower {
                info!(term = st.current_term, leader = ?req.leader_id, "yielding to leader");
                st.role = Role::Follower;
                st.next_index.clear();
                st.match_index.clear();
            }
            st.leader_hint = Some(req.leader_id.clone());

            // Consistency check: our log must hold the leader's previous entry.
            let consistent = req.prev_log_index < 0
                || st
                    .log
                    .get(req.prev_log_index as usize)
                    .map(|e| e.term == req.prev_log_term)
                    .unwrap_or(false);

            let response = if !consistent {
                AppendResponse {
                    term: st.current_term,
                    success: false,
                    last_index: None,
                }
            } else {
                // Skip entries we already hold; truncate from the first conflict.
                let insert_at = (req.prev_log_index + 1) as usize;
                let mut held = 0;
                while held < req.entries.len()
                    && insert_at + held < st.log.len()
                    && st.log[insert_at + held].term == req.entries[held].term
                {
                    held += 1;
                }
                if held < req.entries.len() {
                    if insert_at + held < st.log.len() {
                        warn!(from = insert_at + held, "truncating conflicting log suffix");
                        st.log.truncate(insert_at + held);
                    }
                    st.log.extend(req.entries[held..].iter().cloned());
                    changed = true;
                }

                let last_index = st.log.len() as i64 - 1;
                if req.leader_commit > st.commit_index {
                    st.commit_index = req.leader_commit.min(last_index);
                    self.commit_tx.send_replace(st.commit_index);
                    self.apply_notify.notify_one();
                }
                // Even an empty heartbeat proves the leader is alive, but a
                // rejected AppendEntries must not keep suppressing elections.
                self.reset_election_deadline_locked(&mut st);
                AppendResponse {
                    term: st.current_term,
                    success: true,
                    last_index: Some(last_index),
                }
            };

            let doc = changed.then(|| self.snapshot_locked(&st));
            (response, doc)
        };
        // Success must not be visible before the log change is durable.
        if let Some(doc) = doc {
            self.persist(doc).await;
        }
        response
    }

    // ---- Elections --------------------------------------------------------

    async fn run_election_timer(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let (role, deadline) = {
                let st = self.state.lock().await;
                (st.role, st.election_deadline)
            };
            if role == Role::Leader {
                // Leaders do not time out; parked until step-down or shutdown.
                tokio::select! {
                    _ = self.election_reset.notified() => continue,
                    _ = shutdown.changed() => return,
                }
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let due = {
                        let st = self.state.lock().await;
                        st.role != Role::Leader && Instant::now() >= st.election_deadline
                    };
                    if due {
                        self.run_election().await;
                    }
                }
                _ = self.election_reset.notified() => continue,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_election(&self) {
        let (term, last_log_index, last_log_term, doc) = {
            let mut st = self.state.lock().await;
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.id.clone());
            self.reset_election_deadline_locked(&mut st);
            let last_log_index = st.log.len() as i64 - 1;
            let last_log_term = st.log.last().map(|e| e.term).unwrap_or(0);
            (
                st.current_term,
                last_log_index,
                last_log_term,
                self.snapshot_locked(&st),
            )
        };
        self.persist(doc).await;
        info!(term, "election timeout; requesting votes");

        let request = Message::RequestVote(RequestVote {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        });
        let timeout = self.timing.rpc_timeout;
        let calls = self.peers.iter().map(|peer| {
            let request = request.clone();
            async move { rpc::call(peer, &request, timeout).await }
        });
        let replies = futures::future::join_all(calls).await;

        let mut votes = 1usize; // self-vote
        let mut highest_term = term;
        for reply in replies.into_iter().flatten() {
            if let Message::VoteResponse(vote) = reply {
                if vote.vote_granted {
                    votes += 1;
                }
                highest_term = highest_term.max(vote.term);
            }
        }

        let mut doc = None;
        {
            let mut st = self.state.lock().await;
            if highest_term > st.current_term {
                self.step_down_locked(&mut st, highest_term);
                doc = Some(self.snapshot_locked(&st));
            } else if st.role == Role::Candidate && st.current_term == term {
                if votes >= self.majority() {
                    info!(term, votes, "won election");
                    st.role = Role::Leader;
                    st.leader_hint = Some(self.client_addr.clone());
                    let next = st.log.len() as i64;
                    for peer in &self.peers {
                        st.next_index.insert(peer.clone(), next);
                        st.match_index.insert(peer.clone(), -1);
                    }
                    self.advance_commit_locked(&mut st);
                    let node = self.clone();
                    tokio::spawn(async move { node.run_heartbeats(term).await });
                } else {
                    debug!(term, votes, "election inconclusive; retrying later");
                    self.reset_election_deadline_locked(&mut st);
                }
            }
        }
        if let Some(doc) = doc {
            self.persist(doc).await;
        }
    }

    // ---- Replication (leader side) ----------------------------------------

    async fn run_heartbeats(&self, term: u64) {
        let mut ticker = tokio::time::interval(self.timing.heartbeat_interval);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            {
                let st = self.state.lock().await;
                if st.role != Role::Leader || st.current_term != term {
                    return;
                }
            }
            for peer in self.peers.clone() {
                let node = self.clone();
                tokio::spawn(async move {
                    let _ = node.replicate_once(&peer, term).await;
                });
            }
        }
    }

    /// Drives one peer until it holds `target`, the node steps down, or the
    /// deadline passes.
    async fn replicate_until(&self, peer: String, target: i64, term: u64, deadline: Instant) {
        loop {
            if *self.shutdown_tx.borrow() || Instant::now() >= deadline {
                return;
            }
            match self.replicate_once(&peer, term).await {
                ReplicateStep::Matched(matched) if matched >= target => return,
                ReplicateStep::Matched(_) | ReplicateStep::Conflict => continue,
                ReplicateStep::SteppedDown => return,
                ReplicateStep::Unreachable => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One AppendEntries exchange with one peer, from its current next_index.
    async fn replicate_once(&self, peer: &str, term: u64) -> ReplicateStep {
        let request = {
            let st = self.state.lock().await;
            if st.role != Role::Leader || st.current_term != term {
                return ReplicateStep::SteppedDown;
            }
            let next = st
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(st.log.len() as i64);
            let prev_log_index = next - 1;
            let prev_log_term = if prev_log_index >= 0 {
                st.log[prev_log_index as usize].term
            } else {
                0
            };
            AppendEntries {
                term,
                leader_id: self.client_addr.clone(),
                entries: st.log[next as usize..].to_vec(),
                prev_log_index,
                prev_log_term,
                leader_commit: st.commit_index,
            }
        };
        let sent_up_to = request.prev_log_index + request.entries.len() as i64;

        let reply = rpc::call(peer, &Message::AppendEntries(request), self.timing.rpc_timeout).await;
        let Some(Message::AppendResponse(resp)) = reply else {
            return ReplicateStep::Unreachable;
        };

        let mut doc = None;
        let step = {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader || st.current_term != term {
                ReplicateStep::SteppedDown
            } else if resp.term > st.current_term {
                info!(peer, term = resp.term, "peer has a newer term; stepping down");
                self.step_down_locked(&mut st, resp.term);
                doc = Some(self.snapshot_locked(&st));
                ReplicateStep::SteppedDown
            } else if resp.success {
                let matched = st.match_index.entry(peer.to_string()).or_insert(-1);
                if sent_up_to > *matched {
                    *matched = sent_up_to;
                }
                let matched = *matched;
                st.next_index.insert(peer.to_string(), matched + 1);
                self.advance_commit_locked(&mut st);
                ReplicateStep::Matched(matched)
            } else {
                // Log inconsistency; back up one entry and retry.
                let next = st.next_index.entry(peer.to_string()).or_insert(0);
                if *next > 0 {
                    *next -= 1;
                }
                ReplicateStep::Conflict
            }
        };
        if let Some(doc) = doc {
            self.persist(doc).await;
        }
        step
    }

    /// Advances commit_index to the highest entry of the current term held by
    /// a majority. Entries from older terms commit transitively.
    fn advance_commit_locked(&self, st: &mut RaftState) {
        if st.role != Role::Leader {
            return;
        }
        let last = st.log.len() as i64 - 1;
        let mut new_commit = st.commit_index;
        for idx in (st.commit_index + 1)..=last {
            if st.log[idx as usize].term != st.current_term {
                continue;
            }
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|p| st.match_index.get(*p).copied().unwrap_or(-1) >= idx)
                .count();
            if replicas >= self.majority() {
                new_commit = idx;
            }
        }
        if new_commit > st.commit_index {
            debug!(commit_index = new_commit, "commit index advanced");
            st.commit_index = new_commit;
            self.commit_tx.send_replace(new_commit);
            self.apply_notify.notify_one();
        }
    }

    // ---- Shared helpers ---------------------------------------------------

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn step_down_locked(&self, st: &mut RaftState, term: u64) {
        st.role = Role::Follower;
        st.current_term = term;
        st.voted_for = None;
        st.next_index.clear();
        st.match_index.clear();
        self.reset_election_deadline_locked(st);
    }

    fn reset_election_deadline_locked(&self, st: &mut RaftState) {
        st.election_deadline = Instant::now() + random_timeout(self.timing.election_timeout);
        self.election_reset.notify_one();
    }

    fn snapshot_locked(&self, st: &RaftState) -> PersistentState {
        PersistentState {
            current_term: st.current_term,
            voted_for: st.voted_for.clone(),
            log: st.log.clone(),
        }
    }

    async fn persist(&self, doc: PersistentState) {
        let Some(file) = &self.state_file else {
            return;
        };
        if let Err(err) = file.save(&doc).await {
            error!(%err, "failed to persist raft state; node is degraded");
            self.state.lock().await.degraded = true;
        }
    }
}

fn random_timeout((min, max): (Duration, Duration)) -> Duration {
    let span = max.saturating_sub(min).as_millis() as u64;
    let jitter = if span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=span)
    };
    min + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, RaftConfig, StorageConfig};
    use serde_json::json;

    fn test_config(consensus_port: u16, peers: Vec<String>) -> Config {
        Config {
            node: NodeConfig {
                node_id: None,
                host: "127.0.0.1".into(),
                client_port: consensus_port,
                consensus_port,
                monitor_port: None,
                peers,
            },
            raft: RaftConfig {
                heartbeat_interval_ms: 50,
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                rpc_timeout_ms: 100,
                submit_timeout_ms: 1000,
                persist_dir: None,
            },
            storage: StorageConfig::default(),
        }
    }

    async fn bare_node(peers: Vec<String>) -> RaftNode {
        RaftNode::new(&test_config(0, peers), None).await.unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn entry(term: u64, n: u64) -> LogEntry {
        LogEntry {
            term,
            command: json!({"n": n}),
        }
    }

    fn append(
        term: u64,
        prev_log_index: i64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: i64,
    ) -> AppendEntries {
        AppendEntries {
            term,
            leader_id: ("127.0.0.1".into(), 9100),
            entries,
            prev_log_index,
            prev_log_term,
            leader_commit,
        }
    }

    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<Value>>);

    #[async_trait::async_trait]
    impl Applicator for Recorder {
        async fn apply(&self, command: &Value) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn stale_term_append_is_rejected() {
        let node = bare_node(vec![]).await;
        let up_to_date = node.handle_append_entries(append(5, -1, 0, vec![], -1)).await;
        assert!(up_to_date.success);

        let stale = node.handle_append_entries(append(3, -1, 0, vec![], -1)).await;
        assert!(!stale.success);
        assert_eq!(stale.term, 5);
    }

    #[tokio::test]
    async fn append_starting_from_empty_log() {
        let node = bare_node(vec![]).await;
        let resp = node
            .handle_append_entries(append(1, -1, 0, vec![entry(1, 0), entry(1, 1)], -1))
            .await;
        assert!(resp.success);
        assert_eq!(resp.last_index, Some(1));
        assert_eq!(node.status().await.log_length, 2);
    }

    #[tokio::test]
    async fn redelivered_entries_are_idempotent() {
        let node = bare_node(vec![]).await;
        let first = vec![entry(1, 0), entry(1, 1), entry(1, 2)];
        node.handle_append_entries(append(1, -1, 0, first, -1)).await;

        // Retry overlaps the first three entries and adds a fourth.
        let retry = vec![entry(1, 0), entry(1, 1), entry(1, 2), entry(1, 3)];
        let resp = node.handle_append_entries(append(1, -1, 0, retry, -1)).await;
        assert!(resp.success);
        assert_eq!(resp.last_index, Some(3));

        let st = node.state.lock().await;
        assert_eq!(st.log.len(), 4);
        assert_eq!(st.log[3].command, json!({"n": 3}));
    }

    #[tokio::test]
    async fn conflicting_suffix_is_truncated() {
        let node = bare_node(vec![]).await;
        node.handle_append_entries(append(1, -1, 0, vec![entry(1, 0), entry(1, 1), entry(1, 2)], -1))
            .await;

        // A later-term leader disagrees from index 1 onward.
        let resp = node
            .handle_append_entries(append(2, 0, 1, vec![entry(2, 7)], -1))
            .await;
        assert!(resp.success);

        let st = node.state.lock().await;
        assert_eq!(st.log.len(), 2);
        assert_eq!(st.log[0].term, 1);
        assert_eq!(st.log[1].term, 2);
        assert_eq!(st.log[1].command, json!({"n": 7}));
    }

    #[tokio::test]
    async fn gap_in_log_fails_consistency_check() {
        let node = bare_node(vec![]).await;
        let resp = node
            .handle_append_entries(append(1, 2, 1, vec![entry(1, 3)], -1))
            .await;
        assert!(!resp.success);

        let status = node.status().await;
        assert_eq!(status.log_length, 0);
        // The leader was still valid: term adopted, hint recorded.
        assert_eq!(status.term, 1);
        assert_eq!(status.leader, Some(("127.0.0.1".into(), 9100)));
    }

    #[tokio::test]
    async fn commit_index_is_clamped_to_last_index() {
        let node = bare_node(vec![]).await;
        let resp = node
            .handle_append_entries(append(1, -1, 0, vec![entry(1, 0), entry(1, 1)], 10))
            .await;
        assert!(resp.success);
        assert_eq!(node.status().await.commit_index, 1);
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let node = bare_node(vec![]).await;
        let ask = |candidate: &str| RequestVote {
            term: 1,
            candidate_id: candidate.into(),
            last_log_index: -1,
            last_log_term: 0,
        };

        assert!(node.handle_request_vote(ask("node-a")).await.vote_granted);
        assert!(!node.handle_request_vote(ask("node-b")).await.vote_granted);
        // Re-asking by the same candidate is fine.
        assert!(node.handle_request_vote(ask("node-a")).await.vote_granted);
    }

    #[tokio::test]
    async fn vote_refused_for_stale_log() {
        let node = bare_node(vec![]).await;
        node.handle_append_entries(append(2, -1, 0, vec![entry(2, 0)], -1))
            .await;

        let stale = node
            .handle_request_vote(RequestVote {
                term: 3,
                candidate_id: "node-c".into(),
                last_log_index: 5,
                last_log_term: 1,
            })
            .await;
        assert!(!stale.vote_granted);
        assert_eq!(stale.term, 3);

        let current = node
            .handle_request_vote(RequestVote {
                term: 3,
                candidate_id: "node-c".into(),
                last_log_index: 0,
                last_log_term: 2,
            })
            .await;
        assert!(current.vote_granted);
    }

    #[tokio::test]
    async fn submit_on_follower_reports_leader_hint() {
        let node = bare_node(vec!["127.0.0.1:1".into()]).await;
        assert_eq!(node.submit(json!({"k": "x"})).await, SubmitOutcome::NotLeader(None));

        node.handle_append_entries(append(1, -1, 0, vec![], -1)).await;
        assert_eq!(
            node.submit(json!({"k": "x"})).await,
            SubmitOutcome::NotLeader(Some(("127.0.0.1".into(), 9100)))
        );
    }

    #[tokio::test]
    async fn isolated_minority_grows_term_but_commits_nothing() {
        // Both peers refuse connections: a two-thirds majority is unreachable.
        let node = bare_node(vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()]).await;
        node.handle_append_entries(append(1, -1, 0, vec![entry(1, 0)], -1))
            .await;
        let before = node.status().await.term;

        for _ in 0..3 {
            node.run_election().await;
        }

        let isolated = node.status().await;
        assert_eq!(isolated.term, before + 3);
        assert_eq!(isolated.role, Role::Candidate);
        assert_eq!(isolated.commit_index, -1);
        assert_eq!(
            node.submit(json!({"k": "x"})).await,
            SubmitOutcome::NotLeader(Some(("127.0.0.1".into(), 9100)))
        );

        // On heal the node yields to the legitimate leader's higher term and
        // only then learns what is committed.
        let resp = node
            .handle_append_entries(append(isolated.term + 1, 0, 1, vec![], 0))
            .await;
        assert!(resp.success);
        let healed = node.status().await;
        assert_eq!(healed.role, Role::Follower);
        assert_eq!(healed.term, isolated.term + 1);
        assert_eq!(healed.commit_index, 0);
    }

    #[tokio::test]
    async fn single_node_cluster_commits_synchronously() {
        let recorder = Arc::new(Recorder::default());
        let node = RaftNode::new(&test_config(free_port(), vec![]), Some(recorder.clone()))
            .await
            .unwrap();
        node.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !node.is_leader().await {
            assert!(Instant::now() < deadline, "no leader within deadline");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(
            node.submit(json!({"k": "x", "v": 1})).await,
            SubmitOutcome::Committed(0)
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if recorder.0.lock().unwrap().len() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "command never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.0.lock().unwrap()[0], json!({"k": "x", "v": 1}));

        let status = node.status().await;
        assert_eq!(status.commit_index, 0);
        assert_eq!(status.last_applied, 0);
        node.stop();
    }
}
