// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    mvcc::MvccStore,
    oracle::{Timestamp, TxnId},
    ssi::SerializableStore,
    IsolationLevel,
};
use crate::{Error, UserKey, UserValue};

enum Backend {
    Mvcc(MvccStore),
    Ssi(SerializableStore),
}

/// Hands out transaction handles under a fixed isolation policy
///
/// `Serializable` routes through the SSI conflict detector; the other
/// levels use the plain MVCC store.
pub struct TransactionManager {
    backend: Backend,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(IsolationLevel::Snapshot)
    }
}

impl TransactionManager {
    /// Creates a manager with the given isolation level.
    #[must_use]
    pub fn new(isolation: IsolationLevel) -> Self {
        let backend = match isolation {
            IsolationLevel::Serializable => Backend::Ssi(SerializableStore::new()),
            level => Backend::Mvcc(MvccStore::new(level)),
        };

        Self { backend }
    }

    /// Begins a transaction.
    pub fn begin(&self) -> Transaction<'_> {
        let (txn_id, start_ts) = match &self.backend {
            Backend::Mvcc(store) => store.begin(),
            Backend::Ssi(store) => store.begin(),
        };

        Transaction {
            manager: self,
            txn_id,
            start_ts,
            done: false,
        }
    }

    /// Runs `f` inside a transaction: commit on `Ok`, abort on `Err`.
    ///
    /// The commit itself may fail (e.g. with a serialization failure), in
    /// which case the transaction is already rolled back and the caller may
    /// retry with a fresh one.
    pub fn with_txn<T, F>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> crate::Result<T>,
    {
        let txn = self.begin();

        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }
}

/// A live transaction handle
///
/// Dropping a handle that was neither committed nor aborted aborts it, so
/// locks are always released.
pub struct Transaction<'a> {
    manager: &'a TransactionManager,
    txn_id: TxnId,
    start_ts: Timestamp,
    done: bool,
}

impl Transaction<'_> {
    /// The transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    /// The snapshot timestamp.
    #[must_use]
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn check_open(&self) -> crate::Result<()> {
        if self.done {
            return Err(Error::TransactionEnded);
        }
        Ok(())
    }

    /// Reads a key.
    pub fn read<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        self.check_open()?;

        match &self.manager.backend {
            Backend::Mvcc(store) => store.read(self.txn_id, key.as_ref()),
            Backend::Ssi(store) => store.read(self.txn_id, key.as_ref()),
        }
    }

    /// Writes a key.
    pub fn write<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        self.check_open()?;

        match &self.manager.backend {
            Backend::Mvcc(store) => store.write(self.txn_id, key, value),
            Backend::Ssi(store) => store.write(self.txn_id, key, value),
        }
    }

    /// Deletes a key.
    pub fn delete<K: Into<UserKey>>(&self, key: K) -> crate::Result<()> {
        self.check_open()?;

        match &self.manager.backend {
            Backend::Mvcc(store) => store.delete(self.txn_id, key),
            Backend::Ssi(store) => store.delete(self.txn_id, key),
        }
    }

    /// Commits the transaction.
    ///
    /// On failure the transaction is rolled back, not resumable.
    pub fn commit(mut self) -> crate::Result<Timestamp> {
        self.check_open()?;
        self.done = true;

        match &self.manager.backend {
            Backend::Mvcc(store) => store.commit(self.txn_id),
            Backend::Ssi(store) => store.commit(self.txn_id),
        }
    }

    /// Aborts the transaction. Idempotent.
    pub fn abort(mut self) {
        if self.done {
            return;
        }
        self.done = true;

        match &self.manager.backend {
            Backend::Mvcc(store) => store.abort(self.txn_id),
            Backend::Ssi(store) => store.abort(self.txn_id),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;

            match &self.manager.backend {
                Backend::Mvcc(store) => store.abort(self.txn_id),
                Backend::Ssi(store) => store.abort(self.txn_id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn manager_scoped_commit() -> crate::Result<()> {
        let manager = TransactionManager::default();

        manager.with_txn(|txn| txn.write("k", "v"))?;

        let txn = manager.begin();
        assert_eq!(Some("v".into()), txn.read("k")?);
        txn.commit()?;

        Ok(())
    }

    #[test]
    fn manager_scoped_abort_on_error() -> crate::Result<()> {
        let manager = TransactionManager::default();

        let result: crate::Result<()> = manager.with_txn(|txn| {
            txn.write("k", "v")?;
            Err(Error::WriteConflict)
        });
        assert!(result.is_err());

        let txn = manager.begin();
        assert_eq!(None, txn.read("k")?);
        txn.abort();

        Ok(())
    }

    #[test]
    fn manager_drop_aborts() -> crate::Result<()> {
        let manager = TransactionManager::default();

        {
            let txn = manager.begin();
            txn.write("k", "v")?;
            // Dropped without commit
        }

        let txn = manager.begin();
        assert_eq!(None, txn.read("k")?);

        // The dropped handle released its write lock
        txn.write("k", "other")?;
        txn.commit()?;

        Ok(())
    }

    #[test]
    fn manager_serializable_backend() -> crate::Result<()> {
        let manager = TransactionManager::new(IsolationLevel::Serializable);

        manager.with_txn(|txn| {
            txn.write("alice", "100")?;
            txn.write("bob", "100")
        })?;

        let t1 = manager.begin();
        let t2 = manager.begin();

        t1.read("alice")?;
        t1.read("bob")?;
        t2.read("alice")?;
        t2.read("bob")?;

        t1.write("alice", "-50")?;
        t2.write("bob", "-50")?;

        assert!(matches!(t1.commit(), Err(Error::SerializationFailure)));
        t2.commit()?;

        Ok(())
    }
}
