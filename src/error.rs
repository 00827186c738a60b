// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    raft::NodeId,
};

/// Represents errors that can occur in the key-value stack
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A message referenced a schema that is not registered,
    /// or its payload contradicts the schema
    InvalidSchema(String),

    /// The contacted node is not the leader; the hint (if any) names
    /// the node to retry against
    NotLeader(Option<NodeId>),

    /// No leader could be located in the cluster
    NoLeader,

    /// A write reached fewer than a majority of replicas
    QuorumLost,

    /// Another live transaction holds the write lock for the key
    WriteConflict,

    /// Committing would complete a dangerous structure (two consecutive
    /// rw-antidependencies through this transaction)
    SerializationFailure,

    /// The transaction has already committed or aborted
    TransactionEnded,

    /// Persistent state required for safety could not be written;
    /// the node must stop rather than risk double-voting
    Unrecoverable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SkerryError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(DecodeError::Json(value.to_string()))
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
