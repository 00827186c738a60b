// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A distributed key-value stack built from three layers:
//!
//! 1. a **log-structured storage engine** (append-only segments, hash/sparse/SSTable
//!    indices, bloom filters, compaction, plus an LSM-tree variant),
//! 2. an **MVCC transaction layer** with snapshot isolation and an optional
//!    Serializable Snapshot Isolation (SSI) conflict detector on top,
//! 3. a **Raft consensus tier** that replicates a command log across nodes and
//!    applies it to pluggable deterministic state machines.
//!
//! All servers use threads and blocking I/O; each Raft node runs a request
//! server, an election timer loop and a heartbeat/replication loop.
//!
//! # Example usage
//!
//! ```
//! use skerry::Config;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let engine = Config::new(folder).open()?;
//!
//! engine.put("my_key", "my_value")?;
//! assert_eq!(Some("my_value".as_bytes().into()), engine.get("my_key")?);
//!
//! engine.delete("my_key")?;
//! assert_eq!(None, engine.get("my_key")?);
//!
//! // When enough sealed segments have amassed, merge them
//! engine.force_compaction()?;
//! #
//! # Ok::<(), skerry::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        }
    };
}

pub mod codec;

mod coding;
mod config;
mod error;
mod key_range;

pub mod raft;
pub mod repl;

mod shutdown;
mod slice;

pub mod storage;

pub mod tx;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

#[doc(hidden)]
pub use key_range::KeyRange;

pub use {
    coding::{DecodeError, EncodeError},
    config::Config,
    error::{Error, Result},
    slice::Slice,
    storage::{lsm::LsmTree, StorageEngine},
};

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;
