//! Integration tests for Raft log compaction.
//!
//! Verifies that:
//! - Log compaction triggers when the retained log exceeds the threshold
//! - Lagging followers catch up via InstallSnapshot
//! - State is consistent after compaction and after a restart from a snapshot


use std::time::Duration;

use test_harness::{assert_eventually, TestCluster};

const THRESHOLD: u64 = 8;

async fn compacting_cluster(num_nodes: usize) -> TestCluster {
    TestCluster::with_config(num_nodes, |config| config.snapshot_threshold = THRESHOLD).await
}

/// Test 1: Compaction triggers once the log outgrows the threshold
#[tokio::test]
async fn test_log_compaction_triggered() {
    let mut cluster = compacting_cluster(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let total_writes = 30;
    for i in 0..total_writes {
        cluster
            .set(&format!("key-{}", i), &i.to_string())
            .await
            .unwrap_or_else(|e| panic!("Write {} failed: {}", i, e));
    }

    let leader_id = cluster.get_leader_id().await.unwrap();
    let leader = cluster.get_node(leader_id).unwrap();
    assert_eventually(
        || async {
            let state = leader.raft_node.state.read().await;
            state.log_offset > 0 && (state.log.len() as u64) <= THRESHOLD
        },
        Duration::from_secs(3),
        "Leader should compact its log down to the threshold",
    )
    .await;

    let state = leader.raft_node.state.read().await;
    assert!(
        state.last_log_index() > total_writes,
        "last_log_index should still reflect every entry"
    );
    assert!(
        state.snapshot.is_some(),
        "Snapshot should exist after compaction"
    );
    drop(state);

    // Compacted values are still served
    assert_eq!(cluster.get("key-0").await.unwrap(), Some(b"0".to_vec()));
    assert_eq!(cluster.get("key-29").await.unwrap(), Some(b"29".to_vec()));

    cluster.shutdown().await;
}

/// Test 2: A follower that falls behind the snapshot receives it from the leader
#[tokio::test]
async fn test_snapshot_sent_to_slow_follower() {
    let mut cluster = compacting_cluster(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let slow = cluster.other_node(leader_id);
    cluster.isolate_node(slow).await;

    for i in 0..30 {
        cluster
            .set(&format!("key-{}", i), &i.to_string())
            .await
            .unwrap();
    }

    let leader_id = cluster.get_leader_id().await.unwrap();
    let leader = cluster.get_node(leader_id).unwrap();
    assert_eventually(
        || async { leader.raft_node.state.read().await.log_offset > 0 },
        Duration::from_secs(3),
        "Leader should have compacted past the slow follower",
    )
    .await;

    cluster.heal_node(slow).await;

    assert!(
        cluster
            .wait_for_value_on(&[slow], "key-29", "29", Duration::from_secs(5))
            .await,
        "Slow follower should catch up"
    );
    let follower = cluster.get_node(slow).unwrap();
    assert_eq!(follower.local_get("key-0").await, Some(b"0".to_vec()));
    assert!(
        follower.raft_node.state.read().await.log_offset > 0,
        "Slow follower should hold a snapshot"
    );

    cluster.shutdown().await;
}

/// Test 3: Nodes restart from their snapshot plus the retained log
#[tokio::test]
async fn test_restart_after_compaction() {
    let mut cluster = compacting_cluster(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    for i in 0..25 {
        cluster
            .set(&format!("key-{}", i % 5), &i.to_string())
            .await
            .unwrap();
    }

    let ids = cluster.active_node_ids();
    let leader_commit = {
        let leader_id = cluster.get_leader_id().await.unwrap();
        cluster.get_node(leader_id).unwrap().commit_index().await
    };
    assert!(
        cluster
            .wait_for_commit_on_nodes(&ids, leader_commit, Duration::from_secs(3))
            .await
    );
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.raft_node.state.read().await.log_offset == 0 {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(3),
        "Every node should have compacted",
    )
    .await;

    cluster.restart_all().await;

    for node in cluster.nodes.values() {
        let state = node.raft_node.state.read().await;
        assert!(state.log_offset > 0, "Snapshot should be recovered");
        assert!(state.commit_index >= state.log_offset);
        assert!(state.last_applied >= state.log_offset);
    }

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected after restart");
    for k in 0..5 {
        let expected = (20 + k).to_string();
        assert_eq!(
            cluster.get(&format!("key-{}", k)).await.unwrap(),
            Some(expected.into_bytes())
        );
    }

    cluster.shutdown().await;
}
