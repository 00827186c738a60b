// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    message::{self, ClientResponse, Request, StatusResponse},
    node::{RaftConfig, RaftNode, Role},
    state_machine::StateMachine,
    NodeId,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A locally launched set of Raft nodes
///
/// Binds every member on an ephemeral localhost port, wires up the peer
/// maps, and hands each node its own data directory under `data_dir`.
pub struct Cluster {
    nodes: Vec<RaftNode>,
}

impl Cluster {
    /// Launches (but does not start) `n` nodes.
    pub fn launch<F>(
        n: usize,
        config: &RaftConfig,
        data_dir: &Path,
        machine_factory: F,
    ) -> crate::Result<Self>
    where
        F: Fn() -> Arc<dyn StateMachine>,
    {
        let listeners = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0"))
            .collect::<std::io::Result<Vec<_>>>()?;

        let addrs = listeners
            .iter()
            .enumerate()
            .map(|(id, l)| Ok((id as NodeId, l.local_addr()?)))
            .collect::<std::io::Result<HashMap<_, _>>>()?;

        let mut nodes = Vec::with_capacity(n);

        for (id, listener) in listeners.into_iter().enumerate() {
            let id = id as NodeId;

            let peers = addrs
                .iter()
                .filter(|(peer_id, _)| **peer_id != id)
                .map(|(peer_id, addr)| (*peer_id, *addr))
                .collect::<HashMap<_, _>>();

            nodes.push(RaftNode::from_listener(
                id,
                listener,
                peers,
                machine_factory(),
                data_dir.join(format!("node_{id}")),
                config.clone(),
            )?);
        }

        Ok(Self { nodes })
    }

    /// Starts every node.
    pub fn start(&self) {
        for node in &self.nodes {
            node.start();
        }
    }

    /// Stops every node.
    pub fn stop(&self) {
        for node in &self.nodes {
            node.stop();
        }
    }

    /// Stops one node (a crash, as far as the others can tell).
    pub fn stop_node(&self, id: NodeId) {
        if let Some(node) = self.node(id) {
            node.stop();
        }
    }

    /// The node with the given id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&RaftNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// All nodes.
    #[must_use]
    pub fn nodes(&self) -> &[RaftNode] {
        &self.nodes
    }

    /// Id of the current leader, if exactly discoverable locally.
    #[must_use]
    pub fn leader_id(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.role() == Role::Leader)
            .map(RaftNode::id)
    }

    /// Cuts all links between the two groups (both directions).
    #[doc(hidden)]
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                if let Some(node) = self.node(a) {
                    node.block_peer(b);
                }
                if let Some(node) = self.node(b) {
                    node.block_peer(a);
                }
            }
        }
    }

    /// Restores all links between the two groups.
    #[doc(hidden)]
    pub fn heal(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                if let Some(node) = self.node(a) {
                    node.unblock_peer(b);
                }
                if let Some(node) = self.node(b) {
                    node.unblock_peer(a);
                }
            }
        }
    }

    /// A client pre-seeded with every member address.
    #[must_use]
    pub fn client(&self) -> Client {
        Client::new(self.nodes.iter().map(RaftNode::addr).collect())
    }
}

/// Leader-following cluster client
///
/// Caches the leader address; on a `not leader` response it follows the
/// `leader_id` hint (learned from status probes), and with no leader in
/// sight it backs off for an election cycle and retries.
pub struct Client {
    addrs: Vec<SocketAddr>,
    timeout: Duration,
    backoff: Duration,
    attempts: usize,
    leader: Mutex<Option<SocketAddr>>,
    known_ids: Mutex<HashMap<NodeId, SocketAddr>>,
}

impl Client {
    /// Creates a client for the given member addresses.
    #[must_use]
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(200),
            attempts: 25,
            leader: Mutex::new(None),
            known_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry backoff (roughly one election timeout).
    #[must_use]
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[allow(clippy::expect_used)]
    fn cached_leader(&self) -> Option<SocketAddr> {
        *self.leader.lock().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn set_leader(&self, addr: Option<SocketAddr>) {
        *self.leader.lock().expect("lock is poisoned") = addr;
    }

    #[allow(clippy::expect_used)]
    fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.known_ids.lock().expect("lock is poisoned").get(&id).copied()
    }

    /// Probes members for the current leader, learning id → addr mappings
    /// along the way.
    fn find_leader(&self) -> Option<SocketAddr> {
        for addr in &self.addrs {
            let Ok(status) =
                message::send::<StatusResponse>(*addr, &Request::Status, self.timeout)
            else {
                continue;
            };

            {
                #[allow(clippy::expect_used)]
                let mut known = self.known_ids.lock().expect("lock is poisoned");
                known.insert(status.node_id, *addr);
            }

            if status.state == "Leader" {
                self.set_leader(Some(*addr));
                return Some(*addr);
            }
        }

        None
    }

    /// Submits a command, rerouting and retrying until it commits.
    pub fn request(&self, command: Value) -> crate::Result<ClientResponse> {
        let mut no_leader_hint: Option<NodeId> = None;

        for _ in 0..self.attempts {
            let target = self
                .cached_leader()
                .or_else(|| no_leader_hint.take().and_then(|id| self.addr_of(id)))
                .or_else(|| self.find_leader());

            let Some(addr) = target else {
                std::thread::sleep(self.backoff);
                continue;
            };

            let request = Request::ClientRequest {
                command: command.clone(),
            };

            match message::send::<ClientResponse>(addr, &request, self.timeout) {
                Ok(response) if response.ok => {
                    self.set_leader(Some(addr));
                    return Ok(response);
                }
                Ok(response) => {
                    self.set_leader(None);
                    no_leader_hint = response.leader_id;
                    std::thread::sleep(self.backoff);
                }
                Err(e) => {
                    log::trace!("request to {addr} failed: {e}");
                    self.set_leader(None);
                    std::thread::sleep(self.backoff);
                }
            }
        }

        Err(crate::Error::NoLeader)
    }

    /// Sets a key.
    pub fn set(&self, key: &str, value: &Value) -> crate::Result<ClientResponse> {
        self.request(json!({ "op": "set", "key": key, "value": value }))
    }

    /// Reads a key through the log (linearizable).
    pub fn get(&self, key: &str) -> crate::Result<Option<Value>> {
        let response = self.request(json!({ "op": "get", "key": key }))?;

        Ok(response
            .result
            .as_ref()
            .and_then(|r| r.get("value"))
            .filter(|v| !v.is_null())
            .cloned())
    }

    /// Deletes a key.
    pub fn delete(&self, key: &str) -> crate::Result<ClientResponse> {
        self.request(json!({ "op": "delete", "key": key }))
    }

    /// Compare-and-swap; returns the state machine's verdict.
    pub fn cas(&self, key: &str, expected: &Value, value: &Value) -> crate::Result<Value> {
        let response = self.request(json!({
            "op": "cas",
            "key": key,
            "expected": expected,
            "value": value,
        }))?;

        response.result.ok_or(crate::Error::NoLeader)
    }

    /// Status of every member, `None` for unreachable ones.
    #[must_use]
    pub fn status(&self) -> HashMap<SocketAddr, Option<StatusResponse>> {
        self.addrs
            .iter()
            .map(|addr| {
                let status =
                    message::send::<StatusResponse>(*addr, &Request::Status, self.timeout).ok();
                (*addr, status)
            })
            .collect()
    }
}
