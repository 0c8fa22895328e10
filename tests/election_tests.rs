//! Leader election tests.
//!
//! Clusters start with one bootstrapping node; the others join through it
//! and take part in elections once they are members.


use std::time::Duration;

use raft_node::raft::{Payload, RaftRole};
use test_harness::{addr, assert_eventually, TestCluster};

#[tokio::test]
async fn test_single_node_bootstraps_as_leader() {
    let cluster = TestCluster::new(1, 51000).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Bootstrap node should lead");
    assert_eq!(leader, 51000);

    let node = cluster.get_node(leader).unwrap();
    assert_eq!(node.current_term().await, 1);
    assert_eq!(node.members().await, vec![51000]);

    let result = cluster.submit("hello").await.expect("Command should commit");
    assert_eq!(result, Some(Payload::from("hello")));
    assert_eq!(node.applied(), vec![Payload::from("hello")]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_three_node_cluster_has_one_leader() {
    let cluster = TestCluster::new(3, 51010).await;

    assert!(
        cluster
            .wait_for_members(&[51010, 51011, 51012], Duration::from_secs(10))
            .await,
        "All nodes should join"
    );
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    assert_eq!(cluster.count_leaders().await, 1, "Exactly one leader");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_followers_learn_leader_and_term() {
    let cluster = TestCluster::new(3, 51020).await;
    assert!(
        cluster
            .wait_for_members(&[51020, 51021, 51022], Duration::from_secs(10))
            .await
    );
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let term = cluster.get_node(leader).unwrap().current_term().await;

    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.raft_node.recent_leader().await != Some(addr(leader)) {
                    return false;
                }
                if node.current_term().await != term {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(5),
        "Every node should know the leader and share its term",
    )
    .await;

    for port in cluster.active_ports() {
        if port != leader {
            assert_eq!(
                cluster.get_node(port).unwrap().role().await,
                RaftRole::Follower
            );
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_command_submitted_to_follower_is_forwarded() {
    let cluster = TestCluster::new(3, 51030).await;
    assert!(
        cluster
            .wait_for_members(&[51030, 51031, 51032], Duration::from_secs(10))
            .await
    );
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower = cluster
        .active_ports()
        .into_iter()
        .find(|&port| port != leader)
        .expect("Should have a follower");

    // Make sure the follower has heard from the leader
    assert_eventually(
        || async {
            cluster
                .get_node(follower)
                .unwrap()
                .raft_node
                .recent_leader()
                .await
                .is_some()
        },
        Duration::from_secs(5),
        "Follower should know the leader",
    )
    .await;

    let result = cluster
        .submit_to(follower, "forwarded")
        .await
        .expect("Forwarded command should commit");
    assert_eq!(result, Some(Payload::from("forwarded")));

    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(5)).await);
    assert!(cluster.verify_applied_consistency());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_commit_subscription_advances() {
    let cluster = TestCluster::new(1, 51040).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let node = cluster.get_node(leader).unwrap();

    let mut commits = node.raft_node.subscribe_commits();
    let before = *commits.borrow_and_update();

    cluster.submit("one").await.expect("Command should commit");
    tokio::time::timeout(Duration::from_secs(2), commits.changed())
        .await
        .expect("Commit notification should arrive")
        .expect("Sender should be alive");
    assert!(*commits.borrow() > before);

    cluster.shutdown().await;
}
