//! Restart tests with on-disk node state.


use std::time::Duration;

use raft_node::raft::Payload;
use test_harness::{assert_eventually, test_raft_config, TestCluster};

#[tokio::test]
async fn test_single_node_restarts_with_its_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::empty(test_raft_config()).persist_to(dir.path());
    cluster.start_node(55000, true, &[]);

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Bootstrap node should lead");
    for i in 0..3 {
        cluster
            .submit(&format!("durable-{}", i))
            .await
            .expect("Command should commit");
    }
    let node = cluster.get_node(55000).unwrap();
    let term_before = node.current_term().await;
    let last_before = node.last_index().await;

    cluster.shutdown_node(55000);
    tokio::time::sleep(Duration::from_millis(100)).await;

    cluster.start_node(55000, true, &[]);
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Restarted node should lead again");

    let node = cluster.get_node(55000).unwrap();
    assert!(node.current_term().await > term_before);
    assert_eq!(node.members().await, vec![55000]);
    // The old log plus the new leader's noop
    assert_eq!(node.last_index().await, last_before + 1);

    assert_eventually(
        || async { node.applied().len() == 3 },
        Duration::from_secs(5),
        "Replayed commands should be applied once recommitted",
    )
    .await;
    assert_eq!(
        node.applied(),
        (0..3)
            .map(|i| Payload::from(format!("durable-{}", i)))
            .collect::<Vec<_>>()
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_restart_rejoins_without_membership_change() {
    let dir = tempfile::tempdir().unwrap();
    let ports = [55010, 55011, 55012];
    let mut cluster = TestCluster::empty(test_raft_config()).persist_to(dir.path());
    for (i, &port) in ports.iter().enumerate() {
        cluster.start_node(port, i == 0, &ports);
    }
    assert!(
        cluster
            .wait_for_members(&ports, Duration::from_secs(10))
            .await
    );
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower = ports
        .iter()
        .copied()
        .find(|&port| port != leader)
        .expect("Should have a follower");

    cluster.submit("before-restart").await.expect("Command should commit");
    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(5)).await);
    let term_before = cluster.get_node(follower).unwrap().current_term().await;

    cluster.shutdown_node(follower);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.submit("while-down").await.expect("Quorum is still up");

    cluster.start_node(follower, false, &ports);

    let node = cluster.get_node(follower).unwrap();
    assert!(node.current_term().await >= term_before);
    assert_eq!(node.members().await, ports.to_vec());

    assert!(
        cluster.wait_for_applied_on_all(2, Duration::from_secs(5)).await,
        "Restarted follower should catch up"
    );
    assert!(cluster.verify_applied_consistency());
    assert!(cluster.wait_for_members(&ports, Duration::from_secs(5)).await);

    cluster.shutdown().await;
}
