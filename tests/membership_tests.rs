//! Membership change tests.
//!
//! Nodes join by asking the cluster to add them and leave through
//! `RemoveServer`; both go through a joint configuration first.


use std::time::Duration;

use raft_node::raft::RaftRole;
use test_harness::{assert_eventually, TestCluster};

#[tokio::test]
async fn test_nodes_join_bootstrap_node() {
    let cluster = TestCluster::new(3, 53000).await;

    assert!(
        cluster
            .wait_for_members(&[53000, 53001, 53002], Duration::from_secs(10))
            .await,
        "Every node should end up in the same stable configuration"
    );

    for node in cluster.nodes.values() {
        let meta = node.raft_node.current_meta().await;
        assert!(!meta.config.is_transitioning());
        assert_eq!(meta.members().len(), 3);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_receives_full_log() {
    let mut cluster = TestCluster::new(3, 53010).await;
    assert!(
        cluster
            .wait_for_members(&[53010, 53011, 53012], Duration::from_secs(10))
            .await
    );

    for i in 0..5 {
        cluster
            .submit(&format!("cmd-{}", i))
            .await
            .expect("Command should commit");
    }

    cluster.start_node(53013, false, &[53010, 53011, 53012]);

    assert!(
        cluster
            .wait_for_members(&[53010, 53011, 53012, 53013], Duration::from_secs(10))
            .await,
        "New node should be added"
    );
    assert!(
        cluster.wait_for_applied_on_all(5, Duration::from_secs(5)).await,
        "New node should apply the existing commands"
    );
    assert!(cluster.verify_applied_consistency());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_member_change_notification() {
    let mut cluster = TestCluster::new(1, 53020).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Bootstrap node should lead");

    let mut members = cluster
        .get_node(leader)
        .unwrap()
        .raft_node
        .subscribe_members();
    assert_eq!(members.borrow_and_update().len(), 1);

    cluster.start_node(53021, false, &[53020]);

    assert_eventually(
        || async { members.borrow().len() == 2 },
        Duration::from_secs(10),
        "Leader should publish the new member set",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remove_follower() {
    let mut cluster = TestCluster::new(3, 53030).await;
    assert!(
        cluster
            .wait_for_members(&[53030, 53031, 53032], Duration::from_secs(10))
            .await
    );
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let removed = cluster
        .active_ports()
        .into_iter()
        .find(|&port| port != leader)
        .expect("Should have a follower");
    let remaining: Vec<u16> = cluster
        .active_ports()
        .into_iter()
        .filter(|&port| port != removed)
        .collect();

    cluster.remove_server(removed).await.expect("Remove request");

    // The removed node hears about the final configuration too
    assert!(
        cluster
            .wait_for_members(&remaining, Duration::from_secs(10))
            .await,
        "Removal should commit"
    );
    cluster.shutdown_node(removed);

    cluster
        .submit("after-removal")
        .await
        .expect("Remaining nodes should commit");
    assert_eq!(cluster.get_leader_port().await, Some(leader));
    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(5)).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remove_leader_hands_over() {
    let cluster = TestCluster::new(3, 53040).await;
    assert!(
        cluster
            .wait_for_members(&[53040, 53041, 53042], Duration::from_secs(10))
            .await
    );
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let remaining: Vec<u16> = cluster
        .active_ports()
        .into_iter()
        .filter(|&port| port != old_leader)
        .collect();

    cluster
        .remove_server(old_leader)
        .await
        .expect("Remove request");

    assert!(
        cluster
            .wait_for_members(&remaining, Duration::from_secs(10))
            .await,
        "Removal should commit"
    );
    let new_leader = cluster
        .wait_for_new_leader(old_leader, Duration::from_secs(5))
        .await
        .expect("Remaining members should elect a leader");
    assert!(remaining.contains(&new_leader));

    // The removed node stays a quiet follower
    assert_eq!(
        cluster.get_node(old_leader).unwrap().role().await,
        RaftRole::Follower
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        cluster.get_node(old_leader).unwrap().role().await,
        RaftRole::Follower
    );
    assert_eq!(cluster.count_leaders().await, 1);

    cluster
        .submit_to(new_leader, "after-handover")
        .await
        .expect("New leader should commit");

    cluster.shutdown().await;
}
