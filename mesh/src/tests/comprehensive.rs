//! Cluster-level tests
//!
//! - Convergence on line, full-mesh and tree topologies
//! - Deduplication under repeated and concurrent submission
//! - Cursor behaviour with healthy, partitioned and isolated neighbors
//! - Malformed input handling on a live cluster

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use tracing::info;

use super::test_utils::{
    fast_config, full_mesh, topology, wait_until, within, TestCluster,
};
use crate::{error::codes, protocol::Payload};

const CONVERGE: Duration = Duration::from_secs(5);

//
// ====================================================================================
// Convergence
// ====================================================================================
//

#[tokio::test]
async fn test_line_topology_single_value_reaches_every_node() {
    let line = topology(&[("n0", &["n1"]), ("n1", &["n0", "n2"]), ("n2", &["n1"])]);
    let (cluster, mut client) = TestCluster::start(&["n0", "n1", "n2"], line, fast_config()).await;

    client.broadcast("n0", 5).await;
    cluster.wait_converged(&BTreeSet::from([5]), CONVERGE).await;

    for name in ["n0", "n1", "n2"] {
        assert_eq!(client.read(name).await, vec![5], "read at {}", name);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_full_mesh_concurrent_values_converge() {
    let names = ["n0", "n1", "n2"];
    let (cluster, mut client) =
        TestCluster::start(&names, full_mesh(&names), fast_config()).await;

    // Submit straight into two nodes at once, bypassing request ordering.
    let (a, b) = tokio::join!(cluster.node("n0").submit(3), cluster.node("n1").submit(7));
    a.unwrap();
    b.unwrap();

    cluster
        .wait_converged(&BTreeSet::from([3, 7]), CONVERGE)
        .await;
    for name in names {
        let values: BTreeSet<i64> = client.read(name).await.into_iter().collect();
        assert_eq!(values, BTreeSet::from([3, 7]));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_tree_topology_many_values_converge() {
    let tree = topology(&[
        ("n0", &["n1", "n2"]),
        ("n1", &["n0", "n3", "n4"]),
        ("n2", &["n0", "n5"]),
        ("n3", &["n1"]),
        ("n4", &["n1"]),
        ("n5", &["n2"]),
    ]);
    let names = ["n0", "n1", "n2", "n3", "n4", "n5"];
    let (cluster, mut client) = TestCluster::start(&names, tree, fast_config()).await;

    let mut expected = BTreeSet::new();
    for value in 0..60i64 {
        let target = names[(value as usize * 7) % names.len()];
        client.broadcast(target, value).await;
        expected.insert(value);
    }

    cluster.wait_converged(&expected, CONVERGE).await;
    for name in names {
        assert_eq!(cluster.node(name).read().len(), expected.len());
    }

    cluster.shutdown().await;
}

//
// ====================================================================================
// Deduplication
// ====================================================================================
//

#[tokio::test]
async fn test_repeated_submission_is_idempotent() {
    let names = ["n0", "n1", "n2"];
    let (cluster, mut client) =
        TestCluster::start(&names, full_mesh(&names), fast_config()).await;

    for _ in 0..3 {
        for name in names {
            client.broadcast(name, 11).await;
            client.broadcast(name, 12).await;
        }
    }

    cluster
        .wait_converged(&BTreeSet::from([11, 12]), CONVERGE)
        .await;
    // Let a few more rounds run; re-gossip must not grow any log.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for name in names {
        let log = cluster.node(name).read();
        assert_eq!(log.len(), 2, "duplicate entries at {}: {:?}", name, log);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clients_no_duplicates() {
    let names = ["n0", "n1", "n2", "n3"];
    let ring = topology(&[
        ("n0", &["n1", "n3"]),
        ("n1", &["n0", "n2"]),
        ("n2", &["n1", "n3"]),
        ("n3", &["n2", "n0"]),
    ]);
    let (cluster, _client) = TestCluster::start(&names, ring, fast_config()).await;

    // Overlapping value ranges submitted from four producers in parallel.
    let nodes = &cluster;
    let produce = move |offset: i64, name: &'static str| async move {
        for v in 0..40i64 {
            nodes.node(name).submit(v + offset).await.unwrap();
        }
    };
    tokio::join!(
        produce(0, "n0"),
        produce(20, "n1"),
        produce(40, "n2"),
        produce(60, "n3")
    );

    let expected: BTreeSet<i64> = (0..100).collect();
    cluster.wait_converged(&expected, CONVERGE).await;
    for name in names {
        assert_eq!(cluster.node(name).read().len(), 100);
    }

    cluster.shutdown().await;
}

//
// ====================================================================================
// Cursor
// ====================================================================================
//

#[tokio::test]
async fn test_cursor_monotonic_and_reaches_log_end() {
    let names = ["n0", "n1", "n2"];
    let (cluster, mut client) =
        TestCluster::start(&names, full_mesh(&names), fast_config()).await;

    let mut cursor = cluster.node("n0").cursor();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let observed = observed.clone();
        tokio::spawn(async move {
            while cursor.changed().await.is_ok() {
                let value = *cursor.borrow_and_update();
                observed.lock().unwrap().push(value);
            }
        })
    };

    for value in 0..30 {
        client.broadcast("n0", value).await;
        if value % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    let n0 = cluster.node("n0");
    let mut final_cursor = n0.cursor();
    within(CONVERGE, final_cursor.wait_for(|c| *c == 30))
        .await
        .unwrap();

    let history = observed.lock().unwrap().clone();
    assert!(!history.is_empty());
    assert!(history.windows(2).all(|w| w[0] <= w[1]), "{:?}", history);
    assert!(history.iter().all(|c| *c <= n0.read().len()));

    recorder.abort();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_partitioned_neighbor_holds_cursor_until_healed() {
    let line = topology(&[("n0", &["n1"]), ("n1", &["n0", "n2"]), ("n2", &["n1"])]);
    let (cluster, mut client) = TestCluster::start(&["n0", "n1", "n2"], line, fast_config()).await;

    cluster.network.partition("n1", "n2");
    client.broadcast("n0", 9).await;

    // n1 receives it, but n2 is cut off, so n1 cannot commit its round.
    assert!(wait_until(CONVERGE, || cluster.read_set("n1").contains(&9)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.read_set("n2").is_empty());
    assert_eq!(*cluster.node("n1").cursor().borrow(), 0);
    assert_eq!(*cluster.node("n0").cursor().borrow(), 1);

    info!("Healing n1 <-> n2");
    cluster.network.heal_all();
    cluster.wait_converged(&BTreeSet::from([9]), CONVERGE).await;
    let mut n1_cursor = cluster.node("n1").cursor();
    within(CONVERGE, n1_cursor.wait_for(|c| *c == 1))
        .await
        .unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_missing_from_topology_commits_locally() {
    // n2 has no entry: it is isolated, and nothing lists it as a neighbor.
    let partial = topology(&[("n0", &["n1"]), ("n1", &["n0"])]);
    let (cluster, mut client) =
        TestCluster::start(&["n0", "n1", "n2"], partial, fast_config()).await;

    client.broadcast("n2", 1).await;
    client.broadcast("n0", 2).await;

    let mut n2_cursor = cluster.node("n2").cursor();
    within(CONVERGE, n2_cursor.wait_for(|c| *c == 1))
        .await
        .unwrap();
    assert!(wait_until(CONVERGE, || cluster.read_set("n1") == BTreeSet::from([2])).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.read_set("n0"), BTreeSet::from([2]));
    assert_eq!(cluster.read_set("n2"), BTreeSet::from([1]));

    cluster.shutdown().await;
}

//
// ====================================================================================
// Error handling
// ====================================================================================
//

#[tokio::test]
async fn test_malformed_gossip_rejected_without_crash() {
    let names = ["n0", "n1"];
    let (cluster, mut client) =
        TestCluster::start(&names, full_mesh(&names), fast_config()).await;

    client
        .send_raw(
            "n0",
            json!({"type": "gossip", "msg_id": 500, "messages": [1, 2]}),
        )
        .await;
    let reply = client.next_reply().await;
    assert_eq!(reply.in_reply_to, Some(500));
    assert!(matches!(
        reply.payload,
        Payload::Error { code, .. } if code == codes::MALFORMED_REQUEST
    ));
    assert!(client.read("n0").await.is_empty());

    // A response type arriving as a request is not something the node serves.
    let reply = client
        .request("n0", Payload::GossipOk { generation: 1 })
        .await;
    assert!(matches!(
        reply.payload,
        Payload::Error { code, .. } if code == codes::NOT_SUPPORTED
    ));

    client.broadcast("n0", 4).await;
    cluster.wait_converged(&BTreeSet::from([4]), CONVERGE).await;

    cluster.shutdown().await;
}
