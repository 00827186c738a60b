// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire},
    },
    Arc,
};

/// Transaction identifier, monotonically increasing from 1
pub type TxnId = u64;

/// Wall-clock-derived logical timestamp (nanoseconds since the Unix epoch,
/// made strictly monotonic)
pub type Timestamp = u64;

/// Thread-safe transaction id generator
#[derive(Clone, Debug, Default)]
pub struct TxnIdCounter(Arc<AtomicU64>);

impl TxnIdCounter {
    /// Gets the next transaction id.
    #[must_use]
    pub fn next(&self) -> TxnId {
        self.0.fetch_add(1, AcqRel) + 1
    }
}

/// Strictly monotonic timestamp source
///
/// Timestamps derive from the wall clock but never repeat or move backwards,
/// even if the system clock stalls or steps.
#[derive(Clone, Debug, Default)]
pub struct TimestampOracle(Arc<AtomicU64>);

impl TimestampOracle {
    /// Returns a timestamp greater than every previously returned one.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        #[allow(clippy::cast_possible_truncation)]
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let mut last = self.0.load(Acquire);

        loop {
            let next = wall.max(last + 1);

            match self.0.compare_exchange_weak(last, next, AcqRel, Acquire) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}
