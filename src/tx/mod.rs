// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Transactions over versioned records: MVCC with pluggable isolation
//! levels, and Serializable Snapshot Isolation on top.

pub mod manager;
pub mod mvcc;
pub mod oracle;
pub mod ssi;

pub use {
    manager::{Transaction, TransactionManager},
    mvcc::MvccStore,
    oracle::{Timestamp, TxnId},
    ssi::SerializableStore,
};

/// Isolation level of a [`TransactionManager`]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IsolationLevel {
    /// Reads observe the newest version, ignoring the snapshot
    ReadUncommitted,

    /// Every read observes the newest *committed* version
    ReadCommitted,

    /// Reads come from a consistent snapshot taken at transaction start;
    /// writes conflict only on overlapping write locks
    #[default]
    Snapshot,

    /// Snapshot isolation plus rw-antidependency tracking; transactions
    /// whose commit could close a serialization cycle abort instead
    Serializable,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "read-uncommitted",
            Self::ReadCommitted => "read-committed",
            Self::Snapshot => "snapshot",
            Self::Serializable => "serializable",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-uncommitted" => Ok(Self::ReadUncommitted),
            "read-committed" => Ok(Self::ReadCommitted),
            "snapshot" => Ok(Self::Snapshot),
            "serializable" => Ok(Self::Serializable),
            _ => Err(crate::Error::InvalidSchema(format!(
                "unknown isolation level: {s}"
            ))),
        }
    }
}
