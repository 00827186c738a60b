// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Replica wire protocol: one JSON request, one JSON response per TCP
//! connection. Requests carry a `cmd` discriminator; the sender closes its
//! write half so the receiver reads to end-of-stream.

use super::{log::LogEntry, LogIndex, NodeId, Term};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

/// A request to a replica
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Candidate soliciting a vote
    RequestVote {
        /// Candidate's term
        term: Term,
        /// Candidate's id
        candidate_id: NodeId,
        /// Index of the candidate's last log entry
        last_log_index: LogIndex,
        /// Term of the candidate's last log entry
        last_log_term: Term,
    },

    /// Leader replicating entries (or heartbeating with none)
    AppendEntries {
        /// Leader's term
        term: Term,
        /// Leader's id, so followers can redirect clients
        leader_id: NodeId,
        /// Index of the entry immediately preceding the new ones
        prev_log_index: LogIndex,
        /// Term of the entry at `prev_log_index`
        prev_log_term: Term,
        /// Entries to store (empty for heartbeat)
        entries: Vec<LogEntry>,
        /// Leader's commit index
        leader_commit: LogIndex,
    },

    /// Client submitting an opaque command
    ClientRequest {
        /// State-machine command
        command: serde_json::Value,
    },

    /// Introspection probe
    Status,
}

/// Response to [`Request::RequestVote`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Receiver's term, for the candidate to update itself
    pub term: Term,
    /// Whether the receiver granted its vote
    pub vote_granted: bool,
}

/// Response to [`Request::AppendEntries`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Receiver's term, for the leader to update itself
    pub term: Term,
    /// Whether the follower's log matched `prev_log_index`/`prev_log_term`
    pub success: bool,
}

/// Response to [`Request::ClientRequest`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientResponse {
    /// Whether the command was committed and applied
    pub ok: bool,

    /// Log index the command was committed at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<LogIndex>,

    /// State-machine result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error description when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Hint at the current leader, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<NodeId>,
}

/// Response to [`Request::Status`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Always true; distinguishes a reply from a dropped connection
    pub ok: bool,
    /// Responding node
    pub node_id: NodeId,
    /// `"Follower"`, `"Candidate"` or `"Leader"`
    pub state: String,
    /// Current term
    pub term: Term,
    /// Last known leader
    pub leader_id: Option<NodeId>,
    /// Highest index known committed
    pub commit_index: LogIndex,
    /// Highest index applied to the state machine
    pub last_applied: LogIndex,
    /// Number of log entries (snapshot-covered entries included)
    pub log_length: u64,
}

/// Sends one request and awaits one response.
///
/// Connect, write and read all share the same deadline; any network error
/// surfaces as `Err` and the caller treats the message as lost.
pub fn send<R: DeserializeOwned>(
    addr: SocketAddr,
    request: &Request,
    timeout: Duration,
) -> crate::Result<R> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let payload = serde_json::to_vec(request)?;
    (&stream).write_all(&payload)?;
    stream.shutdown(Shutdown::Write)?;

    let mut buf = Vec::new();
    (&stream).read_to_end(&mut buf)?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Reads one request from an accepted connection.
pub(crate) fn read_request(stream: &TcpStream) -> crate::Result<Request> {
    let mut buf = Vec::new();
    let mut reader = stream;
    reader.read_to_end(&mut buf)?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Writes one response to an accepted connection.
pub(crate) fn write_response<T: Serialize>(stream: &TcpStream, response: &T) -> crate::Result<()> {
    let payload = serde_json::to_vec(response)?;
    let mut writer = stream;
    writer.write_all(&payload)?;
    Ok(())
}
