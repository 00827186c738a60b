use skerry::{
    tx::{IsolationLevel, TransactionManager},
    Error,
};
use std::sync::{Arc, Barrier};
use test_log::test;

fn parse_balance(value: Option<skerry::Slice>) -> i64 {
    value
        .and_then(|v| String::from_utf8(v.to_vec()).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn seed_accounts(manager: &TransactionManager) -> skerry::Result<()> {
    manager.with_txn(|txn| {
        txn.write("alice", "100")?;
        txn.write("bob", "100")
    })?;
    Ok(())
}

/// Both transactions read both balances and, if the total allows it,
/// withdraw from their own account. Returns (commits, final sum).
fn run_withdrawals(manager: &Arc<TransactionManager>) -> skerry::Result<(usize, i64)> {
    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();

    for account in ["alice", "bob"] {
        let manager = manager.clone();
        let barrier = barrier.clone();

        handles.push(std::thread::spawn(move || -> skerry::Result<bool> {
            let txn = manager.begin();

            let alice = parse_balance(txn.read("alice")?);
            let bob = parse_balance(txn.read("bob")?);
            let total = alice + bob;

            // Both see the snapshot totals before either commits
            barrier.wait();

            if total >= 150 {
                let own = if account == "alice" { alice } else { bob };
                txn.write(account, (own - 150).to_string())?;
            }

            match txn.commit() {
                Ok(_) => Ok(true),
                Err(Error::SerializationFailure) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut commits = 0;
    for handle in handles {
        let committed = handle.join().map_err(|_| Error::Unrecoverable)??;
        if committed {
            commits += 1;
        }
    }

    let (alice, bob) = {
        let txn = manager.begin();
        let alice = parse_balance(txn.read("alice")?);
        let bob = parse_balance(txn.read("bob")?);
        txn.commit()?;
        (alice, bob)
    };

    Ok((commits, alice + bob))
}

#[test]
fn ssi_prevents_write_skew() -> skerry::Result<()> {
    let manager = Arc::new(TransactionManager::new(IsolationLevel::Serializable));
    seed_accounts(&manager)?;

    let (commits, sum) = run_withdrawals(&manager)?;

    assert!(commits <= 1, "both write-skew transactions committed");
    assert!(sum >= 0, "invariant violated: sum = {sum}");

    Ok(())
}

#[test]
fn snapshot_isolation_admits_write_skew() -> skerry::Result<()> {
    let manager = Arc::new(TransactionManager::new(IsolationLevel::Snapshot));
    seed_accounts(&manager)?;

    let (commits, sum) = run_withdrawals(&manager)?;

    // The anomaly SSI exists to prevent: disjoint writes, both commit,
    // and the invariant breaks
    assert_eq!(2, commits);
    assert_eq!(-100, sum);

    Ok(())
}

#[test]
fn serialization_failure_retry_succeeds() -> skerry::Result<()> {
    let manager = Arc::new(TransactionManager::new(IsolationLevel::Serializable));
    seed_accounts(&manager)?;

    let (commits, _) = run_withdrawals(&manager)?;
    assert!(commits <= 1);

    // The aborted party retries on a fresh snapshot and sees the truth
    let txn = manager.begin();
    let alice = parse_balance(txn.read("alice")?);
    let bob = parse_balance(txn.read("bob")?);

    if alice + bob >= 150 {
        txn.write("alice", (alice - 150).to_string())?;
    }

    txn.commit()?;

    let check = manager.begin();
    let sum = parse_balance(check.read("alice")?) + parse_balance(check.read("bob")?);
    check.abort();

    assert!(sum >= -100);

    Ok(())
}
