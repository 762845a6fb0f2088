//! tests/integration/consensus.rs
//!
//! Byzantine agreement scenarios over a real three-node cluster: honest
//! convergence, and convergence of the honest majority despite one liar.

use crate::common::harness::{self, TestNode};
use serde_json::Value;
use std::time::Duration;
use test_log::test;

/// Spawns three mutually-acquainted nodes.
async fn spawn_cluster() -> (TestNode, TestNode, TestNode) {
    let node_a = TestNode::spawn(vec![]).await.expect("Failed to spawn node A");
    let node_b = TestNode::spawn(vec![node_a.peer_key()])
        .await
        .expect("Failed to spawn node B");
    let node_c = TestNode::spawn(vec![node_a.peer_key(), node_b.peer_key()])
        .await
        .expect("Failed to spawn node C");

    // Wait until every node sees the other two.
    for node in [&node_a, &node_b, &node_c] {
        let mut admin = node.admin().await.expect("admin connect");
        harness::wait_for_response(
            &mut admin,
            "peers",
            |response| harness::peer_count(response) == 2,
            Duration::from_secs(5),
        )
        .await
        .expect("cluster never became fully connected");
    }

    (node_a, node_b, node_c)
}

async fn set_word(node: &TestNode, index: usize, word: &str) {
    let mut admin = node.admin().await.expect("admin connect");
    let response = admin
        .request(&format!("set {index} {word}"))
        .await
        .expect("set request");
    assert_eq!(response["status"], "done", "set failed: {response:?}");
}

/// Polls `current` until slot `index` equals `expected`.
async fn wait_for_word(node: &TestNode, index: usize, expected: &str) {
    let mut admin = node.admin().await.expect("admin connect");
    harness::wait_for_response(
        &mut admin,
        "current",
        |response| response["words"][index] == Value::from(expected),
        Duration::from_secs(5),
    )
    .await
    .unwrap_or_else(|e| panic!("word {index} never became {expected:?}: {e}"));
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_honest_cluster_converges_on_plurality() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let (node_a, node_b, node_c) = spawn_cluster().await;

        set_word(&node_a, 0, "apple").await;
        set_word(&node_b, 0, "banana").await;
        set_word(&node_c, 0, "apple").await;

        let mut admin_a = node_a.admin().await.expect("admin connect");
        let response = admin_a.request("consensus 0").await.expect("consensus request");
        assert_eq!(response["status"], "started");

        // The plurality of the initial proposals wins everywhere.
        wait_for_word(&node_a, 0, "apple").await;
        wait_for_word(&node_b, 0, "apple").await;
        wait_for_word(&node_c, 0, "apple").await;

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_honest_majority_survives_one_liar() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let (node_a, node_b, node_c) = spawn_cluster().await;

        set_word(&node_a, 0, "apple").await;
        set_word(&node_b, 0, "banana").await;
        set_word(&node_c, 0, "apple").await;

        // C corrupts every reply it emits.
        let mut admin_c = node_c.admin().await.expect("admin connect");
        let response = admin_c.request("lie 1.0").await.expect("lie request");
        assert_eq!(response["status"], "started");

        let mut admin_a = node_a.admin().await.expect("admin connect");
        admin_a.request("consensus 0").await.expect("consensus request");

        // The honest nodes still converge on the honest plurality.
        wait_for_word(&node_a, 0, "apple").await;
        wait_for_word(&node_b, 0, "apple").await;

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}
