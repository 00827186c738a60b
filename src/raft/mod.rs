// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Raft consensus: leader election, log replication and deterministic state
//! machines, over a JSON-over-TCP wire protocol.
//!
//! Each node runs three concurrent activities on plain threads: a request
//! server, an election timer loop and a heartbeat/replication loop. The
//! election timer is never starved by replication traffic because the loops
//! run on their own threads.

pub mod cluster;
pub mod log;
pub mod message;
pub mod node;
pub mod snapshot;
pub mod state_machine;

/// Node identifier, unique within a cluster
pub type NodeId = u64;

/// Election term; monotonically non-decreasing on every node
pub type Term = u64;

/// Log position; the first entry has index 1, 0 means "none"
pub type LogIndex = u64;

pub use {
    cluster::{Client, Cluster},
    log::{LogEntry, MetadataStore, PersistentLog},
    node::{RaftConfig, RaftNode, Role},
    state_machine::{ElectionMachine, KvMachine, LockMachine, StateMachine},
};
