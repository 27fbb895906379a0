//! Chunk migration under live traffic

use minishard::common::keys::{KeyPart, ShardKey, ShardKeySpec};
use minishard::common::{Operation, Predicate};
use minishard::coordinator::InitialChunks;
use minishard::shard::MemoryConnector;
use minishard::{Cluster, Error};
use serde_json::json;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const NS: &str = "app.items";

fn two_shards() -> (Cluster, Arc<MemoryConnector>) {
    let (cluster, connector) = Cluster::in_memory();
    for endpoint in ["mem://shard0", "mem://shard1"] {
        cluster.admin.add_shard(endpoint, BTreeSet::new(), 1.0).unwrap();
    }
    cluster
        .admin
        .shard_collection(
            NS,
            ShardKeySpec::ranged(&["n"]).unwrap(),
            InitialChunks::SplitPoints(vec![ShardKey(vec![KeyPart::Int(1_000_000)])]),
        )
        .unwrap();
    (cluster, connector)
}

fn count_all(cluster: &Cluster) -> usize {
    cluster
        .router
        .dispatch(&Operation::find(
            NS,
            Predicate::all().range("n", Bound::Included(json!(0)), Bound::Unbounded),
        ))
        .unwrap()
        .result
        .documents
        .len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writes_during_migration_are_not_lost() {
    let (cluster, connector) = two_shards();
    for n in 0..200 {
        cluster
            .router
            .dispatch(&Operation::insert(NS, json!({ "n": n })))
            .unwrap();
    }

    let router = cluster.router.clone();
    let written = Arc::new(AtomicUsize::new(0));
    let frozen_retries = Arc::new(AtomicUsize::new(0));
    let writer = {
        let written = written.clone();
        let frozen_retries = frozen_retries.clone();
        thread::spawn(move || {
            for n in 200..700 {
                loop {
                    match router.dispatch(&Operation::insert(NS, json!({ "n": n }))) {
                        Ok(_) => break,
                        Err(Error::RangeFrozen(_)) => {
                            frozen_retries.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => panic!("insert {} failed: {}", n, e),
                    }
                }
                written.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    while written.load(Ordering::SeqCst) < 50 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let outcome = cluster.admin.move_chunk(NS, 1, "shard-1").await.unwrap();
    assert!(outcome.committed());
    writer.join().unwrap();

    assert_eq!(count_all(&cluster), 700);
    let donor = connector.shard("mem://shard0").unwrap();
    let recipient = connector.shard("mem://shard1").unwrap();
    assert_eq!(donor.document_count(NS), 0);
    assert_eq!(recipient.document_count(NS), 700);
}

#[tokio::test]
async fn test_aborted_move_leaves_donor_serving() {
    let (cluster, connector) = two_shards();
    for n in 0..50 {
        cluster
            .router
            .dispatch(&Operation::insert(NS, json!({ "n": n })))
            .unwrap();
    }
    let before = cluster.chunk_map.snapshot(NS).unwrap();

    let recipient = connector.shard("mem://shard1").unwrap();
    recipient.fail_next_installs(1);
    let err = cluster.admin.move_chunk(NS, 1, "shard-1").await.unwrap_err();
    assert!(matches!(err, Error::MigrationAborted(_)));

    let after = cluster.chunk_map.snapshot(NS).unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.chunk(1).unwrap().shard, "shard-0");
    assert_eq!(recipient.document_count(NS), 0);
    assert_eq!(cluster.metrics.migrations_aborted.get(), 1);

    // Writes were never frozen and the chunk can be moved again
    cluster
        .router
        .dispatch(&Operation::insert(NS, json!({ "n": 50 })))
        .unwrap();
    cluster.admin.move_chunk(NS, 1, "shard-1").await.unwrap();
    assert_eq!(count_all(&cluster), 51);
    assert_eq!(recipient.document_count(NS), 51);
}

#[tokio::test]
async fn test_updates_and_deletes_follow_the_chunk() {
    let (cluster, connector) = two_shards();
    for n in 0..20 {
        cluster
            .router
            .dispatch(&Operation::insert(NS, json!({ "n": n, "tag": "old" })))
            .unwrap();
    }
    let mut set = serde_json::Map::new();
    set.insert("tag".to_string(), json!("new"));

    // The spawned ticket does not run before this task yields, so these
    // writes hit the donor ahead of the clone
    let ticket = cluster.migrations.propose(NS, 1, "shard-1").unwrap();
    let running = cluster.migrations.submit(ticket);
    cluster
        .router
        .dispatch(&Operation::update(
            NS,
            Predicate::all().range("n", Bound::Included(json!(0)), Bound::Excluded(json!(10))),
            set,
        ))
        .unwrap();
    cluster
        .router
        .dispatch(&Operation::delete(NS, Predicate::all().eq("n", json!(19))))
        .unwrap();
    let outcome = running.await.unwrap();
    assert!(outcome.committed());

    let docs = cluster
        .router
        .dispatch(&Operation::find(
            NS,
            Predicate::all().range("n", Bound::Included(json!(0)), Bound::Unbounded),
        ))
        .unwrap()
        .result
        .documents;
    assert_eq!(docs.len(), 19);
    let fresh = docs.iter().filter(|d| d["tag"] == json!("new")).count();
    assert_eq!(fresh, 10);
    assert_eq!(connector.shard("mem://shard1").unwrap().document_count(NS), 19);
    assert_eq!(connector.shard("mem://shard0").unwrap().document_count(NS), 0);
}

#[tokio::test]
async fn test_second_coordinator_respects_migration_lock() {
    let (cluster, connector) = two_shards();
    let mut config = cluster.config.clone();
    config.coordinator.node_id = "coord-2".to_string();
    let other = Cluster::new(config, cluster.store.clone(), connector.clone()).unwrap();

    let ticket = cluster.migrations.propose(NS, 1, "shard-1").unwrap();
    let err = other.migrations.propose(NS, 1, "shard-1").unwrap_err();
    assert!(matches!(err, Error::MigrationInProgress(1)));

    assert!(cluster.migrations.cancel(NS, 1));
    let outcome = cluster.migrations.run(ticket).await;
    assert!(outcome.cancelled);

    // The lock record is gone, so the other coordinator may move it
    let outcome = other.migrations.migrate(NS, 1, "shard-1").await.unwrap();
    assert!(outcome.committed());
    assert_eq!(
        cluster.chunk_map.snapshot(NS).unwrap().chunk(1).unwrap().shard,
        "shard-1"
    );
}
