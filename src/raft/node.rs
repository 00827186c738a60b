// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    log::{LogEntry, MetadataStore, PersistentLog},
    message::{
        self, AppendResponse, ClientResponse, Request, StatusResponse, VoteResponse,
    },
    snapshot::{Snapshot, SnapshotStore},
    state_machine::StateMachine,
    LogIndex, NodeId, Term,
};
use crate::shutdown::Shutdown;
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

/// Raft timing and snapshot knobs
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout
    pub election_timeout_max: Duration,

    /// Heartbeat/replication cadence; must stay below the election minimum
    pub heartbeat_interval: Duration,

    /// Per-call deadline for node-to-node RPCs
    pub rpc_timeout: Duration,

    /// Per-call deadline for client requests
    pub client_timeout: Duration,

    /// Snapshot once this many entries accumulated past the last snapshot
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(1_500),
            election_timeout_max: Duration::from_millis(3_000),
            heartbeat_interval: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(1),
            client_timeout: Duration::from_secs(5),
            snapshot_threshold: 1_000,
        }
    }
}

impl RaftConfig {
    /// Sets the election timeout window.
    #[must_use]
    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max.max(min);
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the node-to-node RPC deadline.
    #[must_use]
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Sets the client request deadline.
    #[must_use]
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Sets the log-compaction trigger.
    #[must_use]
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.snapshot_threshold = entries;
        self
    }
}

/// Role of a node within its term
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// Passive replica, resets its election timer on leader contact
    Follower,

    /// Soliciting votes after an election timeout
    Candidate,

    /// Accepts client commands and replicates the log
    Leader,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::Follower => "Follower",
            Self::Candidate => "Candidate",
            Self::Leader => "Leader",
        }
    }
}

struct RaftState {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,

    log: PersistentLog,
    metadata: MetadataStore,

    commit_index: LogIndex,
    last_applied: LogIndex,

    last_included_index: LogIndex,
    last_included_term: Term,

    next_index: FxHashMap<NodeId, LogIndex>,
    match_index: FxHashMap<NodeId, LogIndex>,

    last_heartbeat: Instant,
    election_timeout: Duration,

    /// Results of applied entries, awaiting pickup by client handlers
    apply_results: FxHashMap<LogIndex, serde_json::Value>,

    /// Peers whose traffic is dropped (partition simulation in tests)
    blocked_peers: FxHashSet<NodeId>,
}

struct NodeInner {
    id: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    addr: SocketAddr,
    config: RaftConfig,
    machine: Arc<dyn StateMachine>,
    snapshots: SnapshotStore,
    state: Mutex<RaftState>,
    apply_cv: Condvar,
    shutdown: Shutdown,
    fatal: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
}

/// One Raft replica
///
/// Runs three concurrent activities once started: a TCP request server, an
/// election timer loop and a heartbeat/replication loop. Current term and
/// vote are fsynced before any RPC answer that depends on them; if that
/// persistence fails the node stops rather than risk double-voting.
///
/// The handle is cheap to clone and shareable across threads.
#[derive(Clone)]
pub struct RaftNode(Arc<NodeInner>);

impl RaftNode {
    /// Creates a node, binding its listener and recovering durable state.
    ///
    /// Bind to port 0 to let the OS pick; the effective address is
    /// available via [`RaftNode::addr`] before [`RaftNode::start`].
    pub fn new(
        id: NodeId,
        bind: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
        machine: Arc<dyn StateMachine>,
        data_dir: impl Into<PathBuf>,
        config: RaftConfig,
    ) -> crate::Result<Self> {
        Self::from_listener(id, TcpListener::bind(bind)?, peers, machine, data_dir, config)
    }

    /// Creates a node on an already-bound listener.
    ///
    /// Lets a cluster bind every member on an ephemeral port first, then
    /// hand each node the full peer address map.
    pub fn from_listener(
        id: NodeId,
        listener: TcpListener,
        peers: HashMap<NodeId, SocketAddr>,
        machine: Arc<dyn StateMachine>,
        data_dir: impl Into<PathBuf>,
        config: RaftConfig,
    ) -> crate::Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let metadata = MetadataStore::open(data_dir.join("meta"))?;
        let mut log = PersistentLog::open(data_dir.join("raft.log"))?;
        let snapshots = SnapshotStore::new(data_dir.join("snapshot.json"));

        let mut last_included_index = 0;
        let mut last_included_term = 0;

        if let Some(snapshot) = snapshots.load()? {
            machine.restore(&snapshot.state)?;
            last_included_index = snapshot.last_included_index;
            last_included_term = snapshot.last_included_term;

            if log.is_empty() && log.first_index() <= last_included_index {
                log.set_first_index(last_included_index + 1);
            }
        }

        let addr = listener.local_addr()?;

        let current_term = metadata.current_term();
        let voted_for = metadata.voted_for();

        log::info!(
            "raft node {id} at {addr}: term {current_term}, log [{}, {}], snapshot through {last_included_index}",
            log.first_index(),
            log.last_index(),
        );

        let state = RaftState {
            role: Role::Follower,
            current_term,
            voted_for,
            leader_id: None,
            log,
            metadata,
            commit_index: last_included_index,
            last_applied: last_included_index,
            last_included_index,
            last_included_term,
            next_index: FxHashMap::default(),
            match_index: FxHashMap::default(),
            last_heartbeat: Instant::now(),
            election_timeout: Duration::ZERO,
            apply_results: FxHashMap::default(),
            blocked_peers: FxHashSet::default(),
        };

        let node = Self(Arc::new(NodeInner {
            id,
            peers,
            addr,
            config,
            machine,
            snapshots,
            state: Mutex::new(state),
            apply_cv: Condvar::new(),
            shutdown: Shutdown::default(),
            fatal: AtomicBool::new(false),
            listener: Mutex::new(Some(listener)),
        }));

        {
            let mut state = node.locked();
            state.election_timeout = node.jittered_timeout(current_term);
        }

        Ok(node)
    }

    /// The node's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// The bound listener address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.locked().role
    }

    /// Returns `true` if the node currently believes it is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Local status, equivalent to the `status` wire verb.
    #[must_use]
    pub fn status(&self) -> StatusResponse {
        let state = self.locked();

        StatusResponse {
            ok: true,
            node_id: self.0.id,
            state: state.role.as_str().to_owned(),
            term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_length: state.log.last_index(),
        }
    }

    /// Retained log entries (inspection in tests).
    #[doc(hidden)]
    #[must_use]
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.locked().log.entries_from(1).to_vec()
    }

    /// Drops all traffic to and from a peer (partition simulation).
    #[doc(hidden)]
    pub fn block_peer(&self, peer: NodeId) {
        self.locked().blocked_peers.insert(peer);
    }

    /// Restores traffic to and from a peer.
    #[doc(hidden)]
    pub fn unblock_peer(&self, peer: NodeId) {
        self.locked().blocked_peers.remove(&peer);
    }

    /// Spawns the server, election and heartbeat threads.
    pub fn start(&self) {
        #[allow(clippy::expect_used)]
        let listener = self
            .0
            .listener
            .lock()
            .expect("lock is poisoned")
            .take()
            .expect("start called twice");

        // Request server
        {
            let weak = Arc::downgrade(&self.0);

            std::thread::spawn(move || {
                if listener.set_nonblocking(true).is_err() {
                    return;
                }

                loop {
                    let Some(inner) = weak.upgrade() else { break };

                    if inner.shutdown.is_triggered() {
                        break;
                    }

                    match listener.accept() {
                        Ok((stream, _)) => {
                            let node = Self(inner);
                            std::thread::spawn(move || node.handle_connection(&stream));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            drop(inner);
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        // Election timer loop
        {
            let weak = Arc::downgrade(&self.0);
            let shutdown = self.0.shutdown.clone();

            std::thread::spawn(move || {
                while shutdown.sleep(Duration::from_millis(50)) {
                    let Some(inner) = weak.upgrade() else { break };

                    if inner.fatal.load(Ordering::Acquire) {
                        break;
                    }

                    Self(inner).election_tick();
                }
            });
        }

        // Heartbeat/replication loop
        {
            let weak = Arc::downgrade(&self.0);
            let shutdown = self.0.shutdown.clone();

            std::thread::spawn(move || loop {
                let Some(inner) = weak.upgrade() else { break };

                if inner.fatal.load(Ordering::Acquire) {
                    break;
                }

                let node = Self(inner);
                let interval = node.0.config.heartbeat_interval;

                if node.is_leader() {
                    node.replicate_all();
                }

                drop(node);

                if !shutdown.sleep(interval) {
                    break;
                }
            });
        }
    }

    /// Stops all background activity; in-flight requests finish.
    pub fn stop(&self) {
        self.0.shutdown.trigger();
        self.apply_notify();
    }

    // -----------------------------------------------------------------------
    // Internals

    #[allow(clippy::expect_used)]
    fn locked(&self) -> MutexGuard<'_, RaftState> {
        self.0.state.lock().expect("lock is poisoned")
    }

    fn apply_notify(&self) {
        self.0.apply_cv.notify_all();
    }

    /// Deterministic per-(node, term) timeout inside the configured window.
    fn jittered_timeout(&self, term: Term) -> Duration {
        let min = self.0.config.election_timeout_min;
        let max = self.0.config.election_timeout_max;
        let span = max.saturating_sub(min);

        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.0.id.to_be_bytes());
        buf[8..].copy_from_slice(&term.to_be_bytes());

        let h = xxhash_rust::xxh3::xxh3_64(&buf);

        #[allow(clippy::cast_precision_loss)]
        let fraction = (h % 1_024) as f64 / 1_024.0;

        min + span.mul_f64(fraction)
    }

    fn reset_election_timer(&self, state: &mut RaftState) {
        state.last_heartbeat = Instant::now();
        state.election_timeout = self.jittered_timeout(state.current_term);
    }

    /// Persists term and vote; on failure the node goes fatal and stops.
    fn persist_term_vote(&self, state: &mut RaftState) -> bool {
        let term = state.current_term;
        let voted_for = state.voted_for;

        if let Err(e) = state.metadata.save(term, voted_for) {
            log::error!(
                "node {}: cannot persist term/vote ({e}); stopping to preserve election safety",
                self.0.id,
            );
            self.0.fatal.store(true, Ordering::Release);
            self.0.shutdown.trigger();
            return false;
        }

        true
    }

    fn step_down(&self, state: &mut RaftState, term: Term) {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            self.persist_term_vote(state);
        }

        if state.role != Role::Follower {
            log::debug!("node {} stepping down in term {term}", self.0.id);
        }

        state.role = Role::Follower;
    }

    // -----------------------------------------------------------------------
    // Request handling

    fn handle_connection(&self, stream: &TcpStream) {
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(self.0.config.client_timeout));
        let _ = stream.set_write_timeout(Some(self.0.config.client_timeout));

        let Ok(request) = message::read_request(stream) else {
            return;
        };

        match request {
            Request::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                if self.peer_blocked(candidate_id) {
                    return;
                }

                let response =
                    self.handle_request_vote(term, candidate_id, last_log_index, last_log_term);

                let _ = message::write_response(stream, &response);
            }
            Request::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                if self.peer_blocked(leader_id) {
                    return;
                }

                let response = self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );

                let _ = message::write_response(stream, &response);
            }
            Request::ClientRequest { command } => {
                let response = self.handle_client_request(command);
                let _ = message::write_response(stream, &response);
            }
            Request::Status => {
                let _ = message::write_response(stream, &self.status());
            }
        }
    }

    fn peer_blocked(&self, peer: NodeId) -> bool {
        self.locked().blocked_peers.contains(&peer)
    }

    fn handle_request_vote(
        &self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> VoteResponse {
        let mut state = self.locked();

        if term > state.current_term {
            self.step_down(&mut state, term);
        }

        if term < state.current_term {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let my_last_index = state.log.last_index();
        let my_last_term = state.log.last_term().unwrap_or(state.last_included_term);

        // Candidate's log must be at least as up-to-date as ours
        let log_ok = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index);

        let can_vote = state.voted_for.is_none() || state.voted_for == Some(candidate_id);

        if log_ok && can_vote {
            state.voted_for = Some(candidate_id);

            if !self.persist_term_vote(&mut state) {
                return VoteResponse {
                    term: state.current_term,
                    vote_granted: false,
                };
            }

            self.reset_election_timer(&mut state);

            log::debug!(
                "node {} votes for {candidate_id} in term {term}",
                self.0.id,
            );

            return VoteResponse {
                term: state.current_term,
                vote_granted: true,
            };
        }

        VoteResponse {
            term: state.current_term,
            vote_granted: false,
        }
    }

    fn handle_append_entries(
        &self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> AppendResponse {
        let mut state = self.locked();

        if term > state.current_term {
            self.step_down(&mut state, term);
        }

        if term < state.current_term {
            return AppendResponse {
                term: state.current_term,
                success: false,
            };
        }

        self.reset_election_timer(&mut state);
        state.leader_id = Some(leader_id);
        state.role = Role::Follower;

        let reject = AppendResponse {
            term: state.current_term,
            success: false,
        };

        // Consistency check on the entry preceding the new ones; indices at
        // or below the snapshot base are committed and match by definition
        if prev_log_index > 0 && prev_log_index > state.last_included_index {
            if prev_log_index > state.log.last_index() {
                return reject;
            }

            let local_term = if prev_log_index == state.last_included_index {
                Some(state.last_included_term)
            } else {
                state.log.term_at(prev_log_index)
            };

            match local_term {
                Some(t) if t == prev_log_term => {}
                _ => {
                    // Divergent suffix: drop it and let the leader back off
                    if let Err(e) = state.log.truncate_from(prev_log_index) {
                        log::error!("node {}: log truncation failed: {e}", self.0.id);
                    }
                    return reject;
                }
            }
        }

        for entry in entries {
            if entry.index <= state.last_included_index {
                continue;
            }

            match state.log.term_at(entry.index) {
                Some(t) if t == entry.term => {}
                Some(_) => {
                    if let Err(e) = state.log.truncate_from(entry.index) {
                        log::error!("node {}: log truncation failed: {e}", self.0.id);
                        return reject;
                    }
                    if let Err(e) = state.log.append_entry(entry) {
                        log::error!("node {}: log append failed: {e}", self.0.id);
                        return reject;
                    }
                }
                None => {
                    if let Err(e) = state.log.append_entry(entry) {
                        log::error!("node {}: log append failed: {e}", self.0.id);
                        return reject;
                    }
                }
            }
        }

        if leader_commit > state.commit_index {
            state.commit_index = leader_commit.min(state.log.last_index());
            self.apply_committed(&mut state);
        }

        AppendResponse {
            term: state.current_term,
            success: true,
        }
    }

    fn handle_client_request(&self, command: serde_json::Value) -> ClientResponse {
        let (index, term) = {
            let mut state = self.locked();

            if state.role != Role::Leader {
                return ClientResponse {
                    ok: false,
                    error: Some("not leader".to_owned()),
                    leader_id: state.leader_id,
                    ..Default::default()
                };
            }

            let term = state.current_term;

            let entry = match state.log.append(term, command) {
                Ok(entry) => entry,
                Err(e) => {
                    return ClientResponse {
                        ok: false,
                        error: Some(format!("log append failed: {e}")),
                        ..Default::default()
                    };
                }
            };

            // A single-node cluster commits immediately
            self.advance_commit(&mut state);

            (entry.index, term)
        };

        self.replicate_all();

        // Wait for the entry to be committed and applied
        let deadline = Instant::now() + self.0.config.client_timeout;
        let mut state = self.locked();

        loop {
            if let Some(result) = state.apply_results.remove(&index) {
                // The applied entry must still be ours, not a successor
                // leader's overwrite
                let applied_term = if index == state.last_included_index {
                    Some(state.last_included_term)
                } else {
                    state.log.term_at(index)
                };

                if applied_term == Some(term) {
                    return ClientResponse {
                        ok: true,
                        index: Some(index),
                        result: Some(result),
                        ..Default::default()
                    };
                }

                return ClientResponse {
                    ok: false,
                    error: Some("entry superseded by a newer leader".to_owned()),
                    leader_id: state.leader_id,
                    ..Default::default()
                };
            }

            // The entry may have been truncated by a newer leader before
            // ever committing
            if state.log.term_at(index) != Some(term) && index > state.last_included_index {
                return ClientResponse {
                    ok: false,
                    error: Some("not leader".to_owned()),
                    leader_id: state.leader_id,
                    ..Default::default()
                };
            }

            let now = Instant::now();
            if now >= deadline || self.0.shutdown.is_triggered() {
                return ClientResponse {
                    ok: false,
                    error: Some("commit timeout".to_owned()),
                    leader_id: state.leader_id,
                    ..Default::default()
                };
            }

            let wait = (deadline - now).min(Duration::from_millis(100));

            #[allow(clippy::expect_used)]
            let (guard, _) = self
                .0
                .apply_cv
                .wait_timeout(state, wait)
                .expect("lock is poisoned");
            state = guard;
        }
    }

    // -----------------------------------------------------------------------
    // Elections

    fn election_tick(&self) {
        let due = {
            let state = self.locked();
            state.role != Role::Leader && state.last_heartbeat.elapsed() >= state.election_timeout
        };

        if due {
            self.run_election();
        }
    }

    fn run_election(&self) {
        let (term, last_log_index, last_log_term, targets) = {
            let mut state = self.locked();

            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.0.id);
            state.leader_id = None;

            if !self.persist_term_vote(&mut state) {
                return;
            }

            self.reset_election_timer(&mut state);

            let targets = self
                .0
                .peers
                .iter()
                .filter(|(id, _)| !state.blocked_peers.contains(id))
                .map(|(id, addr)| (*id, *addr))
                .collect::<Vec<_>>();

            let last_log_term = state.log.last_term().unwrap_or(state.last_included_term);

            (
                state.current_term,
                state.log.last_index(),
                last_log_term,
                targets,
            )
        };

        log::debug!("node {} starts election for term {term}", self.0.id);

        let (tx, rx) = mpsc::channel::<VoteResponse>();
        let rpc_timeout = self.0.config.rpc_timeout;

        for (peer_id, addr) in &targets {
            let tx = tx.clone();
            let request = Request::RequestVote {
                term,
                candidate_id: self.0.id,
                last_log_index,
                last_log_term,
            };

            let peer_id = *peer_id;
            let addr = *addr;

            std::thread::spawn(move || {
                match message::send::<VoteResponse>(addr, &request, rpc_timeout) {
                    Ok(response) => {
                        let _ = tx.send(response);
                    }
                    Err(e) => {
                        log::trace!("vote request to node {peer_id} lost: {e}");
                    }
                }
            });
        }

        drop(tx);

        let cluster_size = self.0.peers.len() + 1;
        let mut votes = 1usize;
        let deadline = Instant::now() + rpc_timeout;

        while votes * 2 <= cluster_size {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            match rx.recv_timeout(deadline - now) {
                Ok(response) => {
                    if response.term > term {
                        let mut state = self.locked();
                        if response.term > state.current_term {
                            self.step_down(&mut state, response.term);
                        }
                        return;
                    }

                    if response.vote_granted {
                        votes += 1;
                    }
                }
                Err(_) => break,
            }
        }

        if votes * 2 <= cluster_size {
            // Lost or inconclusive; a fresh timeout decides the next try
            return;
        }

        {
            let mut state = self.locked();

            if state.role != Role::Candidate || state.current_term != term {
                return;
            }

            state.role = Role::Leader;
            state.leader_id = Some(self.0.id);

            let next = state.log.last_index() + 1;

            for peer_id in self.0.peers.keys() {
                state.next_index.insert(*peer_id, next);
                state.match_index.insert(*peer_id, 0);
            }

            log::info!(
                "node {} won election for term {term} with {votes}/{cluster_size} votes",
                self.0.id,
            );
        }

        // Assert leadership immediately
        self.replicate_all();
    }

    // -----------------------------------------------------------------------
    // Replication

    fn replicate_all(&self) {
        for (peer_id, addr) in &self.0.peers {
            let node = self.clone();
            let peer_id = *peer_id;
            let addr = *addr;

            std::thread::spawn(move || node.replicate_to(peer_id, addr));
        }
    }

    fn replicate_to(&self, peer_id: NodeId, addr: SocketAddr) {
        let (request, term, sent_next, last_sent) = {
            let state = self.locked();

            if state.role != Role::Leader || state.blocked_peers.contains(&peer_id) {
                return;
            }

            let next = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(state.log.last_index() + 1)
                // Never below what the snapshot already consumed; the
                // compaction policy keeps follower prefixes retained
                .max(state.last_included_index + 1);

            let prev_log_index = next - 1;

            let prev_log_term = if prev_log_index == 0 {
                0
            } else if prev_log_index == state.last_included_index {
                state.last_included_term
            } else {
                state.log.term_at(prev_log_index).unwrap_or(0)
            };

            let entries = state.log.entries_from(next).to_vec();
            let last_sent = entries.last().map(|e| e.index);

            (
                Request::AppendEntries {
                    term: state.current_term,
                    leader_id: self.0.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: state.commit_index,
                },
                state.current_term,
                next,
                last_sent,
            )
        };

        // Fan-out happens outside the lock
        let response: AppendResponse =
            match message::send(addr, &request, self.0.config.rpc_timeout) {
                Ok(response) => response,
                Err(e) => {
                    // Lost message; the next heartbeat retries
                    log::trace!("append to node {peer_id} lost: {e}");
                    return;
                }
            };

        let mut state = self.locked();

        if response.term > state.current_term {
            self.step_down(&mut state, response.term);
            return;
        }

        if state.role != Role::Leader || state.current_term != term {
            return;
        }

        if response.success {
            if let Some(last) = last_sent {
                state.match_index.insert(peer_id, last);
                state.next_index.insert(peer_id, last + 1);
            }

            self.advance_commit(&mut state);
        } else {
            // Back off one step and retry on the next heartbeat
            state.next_index.insert(peer_id, sent_next.saturating_sub(1).max(1));
        }
    }

    /// Leader-side commit advancement.
    ///
    /// Only entries of the current term are counted against the majority; a
    /// current-term entry reaching quorum commits all earlier entries
    /// transitively.
    fn advance_commit(&self, state: &mut RaftState) {
        let cluster_size = self.0.peers.len() + 1;
        let last = state.log.last_index();

        let mut advanced = false;
        let mut n = state.commit_index + 1;

        while n <= last {
            if state.log.term_at(n) == Some(state.current_term) {
                let replicas = 1 + state
                    .match_index
                    .values()
                    .filter(|&&m| m >= n)
                    .count();

                if replicas * 2 > cluster_size {
                    state.commit_index = n;
                    advanced = true;
                }
            }

            n += 1;
        }

        if advanced {
            self.apply_committed(state);
        }
    }

    /// Applies committed entries in index order under the node mutex.
    fn apply_committed(&self, state: &mut RaftState) {
        let mut applied_any = false;

        while state.last_applied < state.commit_index {
            let next = state.last_applied + 1;

            if next <= state.last_included_index {
                state.last_applied = next;
                continue;
            }

            let Some(entry) = state.log.get(next).cloned() else {
                log::error!("node {}: committed entry {next} missing from log", self.0.id);
                break;
            };

            let result = self.0.machine.apply(&entry);

            state.last_applied = next;
            state.apply_results.insert(next, result);
            applied_any = true;
        }

        if applied_any {
            // Bounded: drop results no client will come back for
            let floor = state.last_applied.saturating_sub(1_024);
            state.apply_results.retain(|idx, _| *idx > floor);

            self.apply_notify();
            self.maybe_snapshot(state);
        }
    }

    /// Snapshots the machine and truncates the log prefix, bounded by the
    /// slowest follower (there is no `install_snapshot` verb).
    fn maybe_snapshot(&self, state: &mut RaftState) {
        if state.last_applied - state.last_included_index <= self.0.config.snapshot_threshold {
            return;
        }

        let Some(term) = state.log.term_at(state.last_applied) else {
            return;
        };

        let snapshot = Snapshot {
            last_included_index: state.last_applied,
            last_included_term: term,
            state: self.0.machine.snapshot(),
        };

        if let Err(e) = self.0.snapshots.save(&snapshot) {
            log::error!("node {}: snapshot failed: {e}", self.0.id);
            return;
        }

        state.last_included_index = snapshot.last_included_index;
        state.last_included_term = snapshot.last_included_term;

        let retain_bound = if state.role == Role::Leader {
            state
                .match_index
                .values()
                .copied()
                .min()
                .unwrap_or(state.last_applied)
        } else {
            state.last_applied
        };

        let up_to = state.last_included_index.min(retain_bound);

        if let Err(e) = state.log.compact_prefix(up_to) {
            log::error!("node {}: log compaction failed: {e}", self.0.id);
        } else {
            log::debug!(
                "node {}: log compacted through index {up_to}",
                self.0.id,
            );
        }
    }
}
