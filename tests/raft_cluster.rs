use serde_json::json;
use skerry::raft::{Cluster, KvMachine, NodeId, RaftConfig, Role, StateMachine};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use test_log::test;

fn fast_config() -> RaftConfig {
    RaftConfig::default()
        .election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .heartbeat_interval(Duration::from_millis(50))
        .rpc_timeout(Duration::from_millis(250))
        .client_timeout(Duration::from_secs(3))
        .snapshot_threshold(10_000)
}

fn kv_factory() -> Arc<dyn StateMachine> {
    Arc::new(KvMachine::new())
}

fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = probe() {
            return Some(value);
        }

        if Instant::now() >= deadline {
            return None;
        }

        std::thread::sleep(Duration::from_millis(25));
    }
}

fn wait_for_leader(cluster: &Cluster, timeout: Duration) -> Option<NodeId> {
    wait_for(timeout, || cluster.leader_id())
}

#[test]
fn cluster_elects_leader_and_serves_requests() -> skerry::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::launch(3, &fast_config(), dir.path(), kv_factory)?;
    cluster.start();

    let leader = wait_for_leader(&cluster, Duration::from_secs(5));
    assert!(leader.is_some(), "no leader elected");

    let client = cluster.client().backoff(Duration::from_millis(100));

    let response = client.set("k1", &json!("v1"))?;
    assert!(response.ok);
    assert!(response.index.is_some());

    assert_eq!(Some(json!("v1")), client.get("k1")?);
    assert_eq!(None, client.get("missing")?);

    client.delete("k1")?;
    assert_eq!(None, client.get("k1")?);

    cluster.stop();
    Ok(())
}

#[test]
fn committed_entries_replicate_to_all_nodes() -> skerry::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::launch(3, &fast_config(), dir.path(), kv_factory)?;
    cluster.start();

    wait_for_leader(&cluster, Duration::from_secs(5)).expect("no leader elected");

    let client = cluster.client().backoff(Duration::from_millis(100));

    for i in 0..5u32 {
        client.set(&format!("key_{i}"), &json!(format!("value_{i}")))?;
    }

    // Followers apply on the next heartbeat round
    let converged = wait_for(Duration::from_secs(5), || {
        cluster
            .nodes()
            .iter()
            .all(|n| n.status().last_applied >= 5)
            .then_some(())
    });
    assert!(converged.is_some(), "followers never caught up");

    // Log matching: same index + same term => identical entries everywhere
    let logs = cluster
        .nodes()
        .iter()
        .map(|n| n.log_entries())
        .collect::<Vec<_>>();

    for other in logs.iter().skip(1) {
        let common = logs[0].len().min(other.len());
        assert_eq!(&logs[0][..common], &other[..common]);
    }

    cluster.stop();
    Ok(())
}

#[test]
fn leader_failure_elects_replacement() -> skerry::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::launch(5, &fast_config(), dir.path(), kv_factory)?;
    cluster.start();

    let first_leader =
        wait_for_leader(&cluster, Duration::from_secs(5)).expect("no leader elected");

    let client = cluster.client().backoff(Duration::from_millis(100));
    let response = client.set("k1", &json!("v1"))?;
    assert!(response.ok);

    cluster.stop_node(first_leader);

    // A replacement must appear within a couple of election timeouts
    let second_leader = wait_for(Duration::from_secs(5), || {
        cluster
            .nodes()
            .iter()
            .filter(|n| n.id() != first_leader)
            .find(|n| n.role() == Role::Leader)
            .map(|n| n.id())
    })
    .expect("no replacement leader");

    assert_ne!(first_leader, second_leader);

    // The committed write survives the failover
    let survivors = cluster
        .nodes()
        .iter()
        .filter(|n| n.id() != first_leader)
        .map(|n| n.addr())
        .collect::<Vec<_>>();

    let client = skerry::raft::Client::new(survivors).backoff(Duration::from_millis(100));
    assert_eq!(Some(json!("v1")), client.get("k1")?);

    cluster.stop();
    Ok(())
}

#[test]
fn split_brain_resolves_toward_majority() -> skerry::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::launch(5, &fast_config(), dir.path(), kv_factory)?;
    cluster.start();

    let leader = wait_for_leader(&cluster, Duration::from_secs(5)).expect("no leader elected");

    // Partition so the old leader keeps a majority: 3 | 2
    let minority = cluster
        .nodes()
        .iter()
        .map(skerry::raft::RaftNode::id)
        .filter(|id| *id != leader)
        .take(2)
        .collect::<Vec<_>>();
    let majority = cluster
        .nodes()
        .iter()
        .map(skerry::raft::RaftNode::id)
        .filter(|id| !minority.contains(id) )
        .collect::<Vec<_>>();

    cluster.partition(&majority, &minority);

    // Writes on the majority side commit
    let majority_addrs = majority
        .iter()
        .filter_map(|id| cluster.node(*id).map(skerry::raft::RaftNode::addr))
        .collect::<Vec<_>>();
    let client = skerry::raft::Client::new(majority_addrs).backoff(Duration::from_millis(100));

    let response = client.set("committed_key", &json!("committed_value"))?;
    assert!(response.ok);

    // Writes on the minority side cannot find a leader
    let minority_addrs = minority
        .iter()
        .filter_map(|id| cluster.node(*id).map(skerry::raft::RaftNode::addr))
        .collect::<Vec<_>>();

    let minority_client = skerry::raft::Client::new(minority_addrs)
        .timeout(Duration::from_millis(500))
        .backoff(Duration::from_millis(100));

    assert!(matches!(
        minority_client.set("doomed", &json!("x")),
        Err(skerry::Error::NoLeader),
    ));

    cluster.heal(&majority, &minority);

    // Within an election cycle the minority adopts the majority's prefix
    let converged = wait_for(Duration::from_secs(5), || {
        minority
            .iter()
            .all(|id| {
                cluster
                    .node(*id)
                    .is_some_and(|n| n.status().last_applied >= response.index.unwrap_or(0))
            })
            .then_some(())
    });
    assert!(converged.is_some(), "minority never converged");

    // Committed entries survive on every node
    for id in minority.iter().chain(majority.iter()) {
        let node = cluster.node(*id).expect("node exists");
        let entries = node.log_entries();

        assert!(
            entries.iter().any(|e| {
                e.command.get("key").and_then(serde_json::Value::as_str) == Some("committed_key")
            }),
            "node {id} lost a committed entry",
        );

        // Nothing from the leaderless side ever entered a log
        assert!(entries.iter().all(|e| {
            e.command.get("key").and_then(serde_json::Value::as_str) != Some("doomed")
        }));
    }

    cluster.stop();
    Ok(())
}

#[test]
fn concurrent_cas_swaps_exactly_once() -> skerry::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::launch(3, &fast_config(), dir.path(), kv_factory)?;
    cluster.start();

    wait_for_leader(&cluster, Duration::from_secs(5)).expect("no leader elected");

    let cluster = Arc::new(cluster);
    let client = cluster.client().backoff(Duration::from_millis(100));
    client.set("k", &json!("v0"))?;

    let mut handles = Vec::new();

    for _ in 0..10 {
        let cluster = cluster.clone();

        handles.push(std::thread::spawn(move || -> skerry::Result<bool> {
            let client = cluster.client().backoff(Duration::from_millis(100));
            let verdict = client.cas("k", &json!("v0"), &json!("v1"))?;

            Ok(verdict.get("swapped").and_then(serde_json::Value::as_bool) == Some(true))
        }));
    }

    let mut swapped = 0;
    let mut losers_saw_v1 = 0;

    for handle in handles {
        if handle.join().map_err(|_| skerry::Error::Unrecoverable)?? {
            swapped += 1;
        } else {
            losers_saw_v1 += 1;
        }
    }

    assert_eq!(1, swapped, "exactly one CAS must win");
    assert_eq!(9, losers_saw_v1);
    assert_eq!(Some(json!("v1")), client.get("k")?);

    cluster.stop();
    Ok(())
}

#[test]
fn node_restart_recovers_term_and_log() -> skerry::Result<()> {
    use skerry::raft::RaftNode;
    use std::collections::HashMap;

    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().join("solo");

    let (term_before, log_before) = {
        let node = RaftNode::new(
            1,
            "127.0.0.1:0".parse().expect("valid addr"),
            HashMap::new(),
            kv_factory(),
            &data_dir,
            fast_config(),
        )?;
        node.start();

        // A single node is its own majority
        wait_for(Duration::from_secs(5), || node.is_leader().then_some(()))
            .expect("solo node never became leader");

        let client = skerry::raft::Client::new(vec![node.addr()]);
        client.set("persisted", &json!("yes"))?;

        let status = node.status();
        node.stop();
        std::thread::sleep(Duration::from_millis(200));

        (status.term, node.log_entries())
    };

    let node = RaftNode::new(
        1,
        "127.0.0.1:0".parse().expect("valid addr"),
        HashMap::new(),
        kv_factory(),
        &data_dir,
        fast_config(),
    )?;

    // Durable state: term never regresses, the log is byte-identical
    assert!(node.status().term >= term_before);
    assert_eq!(log_before, node.log_entries());

    node.start();
    wait_for(Duration::from_secs(5), || node.is_leader().then_some(()))
        .expect("restarted node never became leader");

    let client = skerry::raft::Client::new(vec![node.addr()]);
    assert_eq!(Some(json!("yes")), client.get("persisted")?);

    node.stop();
    Ok(())
}

#[test]
fn snapshot_compacts_log_and_survives_restart() -> skerry::Result<()> {
    use skerry::raft::RaftNode;
    use std::collections::HashMap;

    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().join("solo");
    let config = fast_config().snapshot_threshold(10);

    {
        let node = RaftNode::new(
            1,
            "127.0.0.1:0".parse().expect("valid addr"),
            HashMap::new(),
            kv_factory(),
            &data_dir,
            config.clone(),
        )?;
        node.start();

        wait_for(Duration::from_secs(5), || node.is_leader().then_some(()))
            .expect("solo node never became leader");

        let client = skerry::raft::Client::new(vec![node.addr()]);

        for i in 0..30u32 {
            client.set(&format!("key_{i}"), &json!(i))?;
        }

        assert!(data_dir.join("snapshot.json").exists());

        // The retained log is a suffix, not the whole history
        assert!(node.log_entries().len() < 30);

        node.stop();
        std::thread::sleep(Duration::from_millis(200));
    }

    let node = RaftNode::new(
        1,
        "127.0.0.1:0".parse().expect("valid addr"),
        HashMap::new(),
        kv_factory(),
        &data_dir,
        config,
    )?;
    node.start();

    wait_for(Duration::from_secs(5), || node.is_leader().then_some(()))
        .expect("restarted node never became leader");

    // State restored from snapshot + remaining log
    let client = skerry::raft::Client::new(vec![node.addr()]);
    assert_eq!(Some(json!(0)), client.get("key_0")?);
    assert_eq!(Some(json!(29)), client.get("key_29")?);

    node.stop();
    Ok(())
}
