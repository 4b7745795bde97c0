//! Integration tests for multi-node Raft cluster operations.
//!
//! These tests verify cluster behavior including leader election,
//! log replication, client writes and reads, and consistency across nodes.


use std::collections::HashMap;
use std::time::Duration;

use raft_kv::error::RaftError;
use raft_kv::kv::ClientHandle;
use raft_kv::raft::RaftRole;
use test_harness::{assert_eventually, TestCluster};

/// Test 1: Three-node cluster elects exactly one leader
#[tokio::test]
async fn test_three_node_cluster_elects_leader() {
    let mut cluster = TestCluster::new(3).await;

    // Wait for leader election (max 5 seconds)
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected within 5 seconds");

    // Verify exactly one leader exists
    let leader_count = cluster.count_leaders().await;
    assert_eq!(leader_count, 1, "Exactly one leader should exist");

    // Verify all nodes agree on the leader (eventually)
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.leader_id().await != Some(leader_id) {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(2),
        "All nodes should agree on leader",
    )
    .await;

    cluster.shutdown().await;
}

/// Test 2: A single-node cluster elects itself and commits on its own
#[tokio::test]
async fn test_single_node_cluster() {
    let mut cluster = TestCluster::new(1).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Single node should elect itself");
    assert_eq!(leader_id, 1);

    cluster.set("k", "v").await.expect("Set should succeed");
    assert_eq!(cluster.get("k").await.unwrap(), Some(b"v".to_vec()));

    cluster.shutdown().await;
}

/// Test 3: Writes through the leader are replicated to every follower
#[tokio::test]
async fn test_log_replication_to_followers() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    for i in 0..5 {
        cluster
            .set(&format!("key-{}", i), &format!("value-{}", i))
            .await
            .expect("Set should succeed");
    }

    let all = cluster.active_node_ids();
    for i in 0..5 {
        assert!(
            cluster
                .wait_for_value_on(
                    &all,
                    &format!("key-{}", i),
                    &format!("value-{}", i),
                    Duration::from_secs(3)
                )
                .await,
            "key-{} should be applied on every node",
            i
        );
    }

    cluster.shutdown().await;
}

/// Test 4: Linearizable read sees the latest acknowledged write
#[tokio::test]
async fn test_read_after_write() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    cluster.set("k", "v1").await.unwrap();
    cluster.set("k", "v2").await.unwrap();
    assert_eq!(cluster.get("k").await.unwrap(), Some(b"v2".to_vec()));
    assert_eq!(cluster.get("missing").await.unwrap(), None);

    cluster.shutdown().await;
}

/// Test 5: Followers refuse writes and point at the leader
#[tokio::test]
async fn test_follower_rejects_writes() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    // Followers learn the leader from its first heartbeat
    let follower_id = cluster.other_node(leader_id);
    assert_eventually(
        || async { cluster.get_node(follower_id).unwrap().leader_id().await == Some(leader_id) },
        Duration::from_secs(2),
        "Follower should learn the leader",
    )
    .await;

    let result = cluster.set_on_node(follower_id, "k", "v").await;
    match result {
        Err(RaftError::NotLeader(hint)) => assert_eq!(hint, Some(leader_id)),
        other => panic!("Expected NotLeader, got {:?}", other),
    }

    cluster.shutdown().await;
}

/// Test 6: Delete reports whether the key existed
#[tokio::test]
async fn test_delete_reports_existence() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    cluster.set("k", "v").await.unwrap();

    let leader = cluster.leader_node(leader_id);
    let client = &cluster.client;
    assert!(leader
        .delete("k", client.client_id(), client.next_request_id())
        .await
        .unwrap());
    assert!(!leader
        .delete("k", client.client_id(), client.next_request_id())
        .await
        .unwrap());
    assert_eq!(cluster.get("k").await.unwrap(), None);

    cluster.shutdown().await;
}

/// Test 7: A retried request is applied only once
#[tokio::test]
async fn test_retried_write_is_applied_once() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let leader = cluster.leader_node(leader_id);

    let alice = ClientHandle::with_id("alice");
    let bob = ClientHandle::with_id("bob");
    let request_id = alice.next_request_id();

    leader
        .set("k", "from-alice", alice.client_id(), request_id)
        .await
        .unwrap();
    leader
        .set("k", "from-bob", bob.client_id(), bob.next_request_id())
        .await
        .unwrap();

    // Alice's retry succeeds but must not overwrite Bob's later write
    leader
        .set("k", "from-alice", alice.client_id(), request_id)
        .await
        .expect("Retry should report the first success");
    assert_eq!(cluster.get("k").await.unwrap(), Some(b"from-bob".to_vec()));

    cluster.shutdown().await;
}

/// Test 8: Invalid writes fail without disturbing the cluster
#[tokio::test]
async fn test_invalid_write_rejected() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let result = cluster.set("", "v").await;
    assert!(
        matches!(result, Err(RaftError::Validation(_))),
        "Empty key should be rejected, got {:?}",
        result
    );

    cluster.set("k", "v").await.expect("Valid write should succeed");
    assert_eq!(cluster.get("k").await.unwrap(), Some(b"v".to_vec()));

    cluster.shutdown().await;
}

/// Test 9: Cluster info reports leader, term and every voting member
#[tokio::test]
async fn test_cluster_info() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let info = cluster.leader_node(leader_id).cluster_info().await;
    assert_eq!(info.leader_id, Some(leader_id));
    assert!(info.term >= 1);
    assert_eq!(info.members.len(), 3);
    assert!(info.members.values().all(|m| m.voting));
    assert_eq!(info.members[&2].address, "node-2");

    cluster.shutdown().await;
}

/// Test 10: Logs stay consistent across nodes under a stream of writes
#[tokio::test]
async fn test_log_matching_after_writes() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    for i in 0..20 {
        cluster
            .set(&format!("key-{}", i % 4), &i.to_string())
            .await
            .unwrap();
    }

    let leader_commit = cluster.get_node(leader_id).unwrap().commit_index().await;
    assert!(
        cluster
            .wait_for_commit_on_all(leader_commit, Duration::from_secs(3))
            .await,
        "All nodes should reach the leader's commit index"
    );
    assert!(cluster.verify_log_matching().await, "Logs should match");

    let all = cluster.active_node_ids();
    assert!(
        cluster
            .wait_for_value_on(&all, "key-3", "19", Duration::from_secs(3))
            .await
    );

    cluster.shutdown().await;
}

/// Test 11: Never more than one leader per term
#[tokio::test]
async fn test_election_safety_single_leader_per_term() {
    let mut cluster = TestCluster::new(5).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    // Sample roles while forcing a few elections
    let mut leaders_by_term: HashMap<u64, u64> = HashMap::new();
    for round in 0..3 {
        if let Some(leader_id) = cluster.get_leader_id().await {
            cluster.isolate_node(leader_id).await;
            for _ in 0..20 {
                for (id, node) in &cluster.nodes {
                    if node.raft_node.role().await == RaftRole::Leader {
                        let term = node.current_term().await;
                        let previous = leaders_by_term.insert(term, *id);
                        assert!(
                            previous.is_none() || previous == Some(*id),
                            "Two leaders in term {} (round {})",
                            term,
                            round
                        );
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            cluster.heal_node(leader_id).await;
        }
    }

    cluster.shutdown().await;
}
