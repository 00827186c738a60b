// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Cooperative shutdown for the crate's background loops
///
/// The compaction worker and the Raft timer/heartbeat loops never block on
/// anything interruptible, so they nap between ticks instead; [`Shutdown::sleep`]
/// naps in short slices and bails out as soon as shutdown is requested,
/// keeping teardown prompt without waking anyone up explicitly.
#[derive(Clone, Debug, Default)]
pub(crate) struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// Requests shutdown; loops observe it at their next slice boundary.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Naps for `total`, waking early on shutdown.
    ///
    /// Returns `false` if shutdown was requested before (or while)
    /// sleeping, so loops can be written as `while shutdown.sleep(tick)`.
    pub fn sleep(&self, total: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(25);

        let deadline = Instant::now() + total;

        loop {
            if self.is_triggered() {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn shutdown_interrupts_sleep() {
        let shutdown = Shutdown::default();
        let remote = shutdown.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.trigger();
        });

        let started = Instant::now();
        let completed = shutdown.sleep(Duration::from_secs(30));

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_triggered());

        handle.join().ok();
    }

    #[test]
    fn sleep_runs_to_completion_without_trigger() {
        let shutdown = Shutdown::default();

        assert!(shutdown.sleep(Duration::from_millis(30)));
        assert!(!shutdown.is_triggered());
    }
}
