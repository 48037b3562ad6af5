//! End-to-end replication over a three-member mock-network cluster: a successful local
//! replicate visible everywhere, first-committer-wins on conflict, causal reads, and
//! graceful leave.
//!
//! Nodes run the full pipeline (EVS, PC, GCS, cache, certification, appliers); only
//! the transport is mocked, with channels. Nothing here leaves the process or the
//! tempdirs the caches live in.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use log::LevelFilter;
use tandem::{ReplicationError, Seqno, ViewKind};

use common::logging::setup_logger;
use common::network::Hub;
use common::node::{eventually, start_cluster, MockDb};

#[test]
fn local_replicate_reaches_every_member() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 3);

    // The configuration change consumed seqno 0; the first write-set gets 1.
    let seqno = nodes[0].write(b"k1", b"v1").unwrap();
    assert_eq!(seqno, Seqno::new(1));

    assert!(
        eventually(Duration::from_secs(10), || {
            nodes.iter().all(|node| node.db.get(b"k1") == Some(b"v1".to_vec()))
        }),
        "all three members apply the write"
    );

    for node in &nodes {
        let view = node.db.latest_view().expect("view delivered");
        assert_eq!(view.kind, ViewKind::Primary);
        assert_eq!(view.members.len(), 3);
    }
}

#[test]
fn concurrent_conflicting_writes_first_committer_wins() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 2);

    // Both members replicate a write to the same key from the same snapshot: neither
    // commits before both write-sets are in flight.
    let barrier = Arc::new(Barrier::new(2));
    let mut results: Vec<Result<Seqno, ReplicationError>> = Vec::new();
    thread::scope(|scope| {
        let handles: Vec<_> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    let value = format!("from-node-{}", index).into_bytes();
                    let data = MockDb::encode_rows(&vec![(b"contested".to_vec(), value)]);
                    barrier.wait();
                    let result = node.replicate_row(b"contested", &data);
                    if let Ok(seqno) = result {
                        node.db.apply_rows(seqno, &data);
                        node.replicator.commit(seqno).unwrap();
                    }
                    result
                })
            })
            .collect();
        for handle in handles {
            results.push(handle.join().unwrap());
        }
    });

    let winners = results.iter().filter(|result| result.is_ok()).count();
    let losers = results
        .iter()
        .filter(|result| matches!(result, Err(ReplicationError::CertificationFailed)))
        .count();
    assert_eq!(winners, 1, "exactly one write-set certifies");
    assert_eq!(losers, 1, "the other fails certification");

    // Everyone converges on the winner's value.
    let winner_index = results.iter().position(|result| result.is_ok()).unwrap();
    let expected = format!("from-node-{}", winner_index).into_bytes();
    assert!(eventually(Duration::from_secs(10), || {
        nodes
            .iter()
            .all(|node| node.db.get(b"contested") == Some(expected.clone()))
    }));
}

#[test]
fn causal_read_waits_for_the_commit_horizon() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 3);

    let seqno = nodes[0].write(b"causal-key", b"causal-value").unwrap();

    // A causal read at another member returns only once everything ordered before it
    // has been committed there, so the write must be visible afterwards.
    let point = nodes[1].replicator.causal_read().unwrap();
    assert!(point >= seqno);
    assert_eq!(nodes[1].db.get(b"causal-key"), Some(b"causal-value".to_vec()));
}

#[test]
fn graceful_leave_reforms_the_primary_and_fails_the_leaver() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 3);

    nodes[0].write(b"before-leave", b"x").unwrap();
    assert!(eventually(Duration::from_secs(10), || {
        nodes.iter().all(|node| node.db.get(b"before-leave").is_some())
    }));

    nodes[0].replicator.close();

    // The two remaining members install a new primary view without the leaver.
    assert!(
        eventually(Duration::from_secs(10), || {
            [1, 2].iter().all(|index| {
                nodes[*index]
                    .db
                    .latest_view()
                    .map(|view| view.kind == ViewKind::Primary && view.members.len() == 2)
                    .unwrap_or(false)
            })
        }),
        "survivors re-form a two-member primary component"
    );

    // The leaver's API is dead.
    assert_eq!(
        nodes[0].write(b"after-leave", b"x"),
        Err(ReplicationError::ConnectionLost)
    );

    // The survivors keep replicating.
    nodes[1].write(b"after-leave", b"y").unwrap();
    assert!(eventually(Duration::from_secs(10), || {
        nodes[2].db.get(b"after-leave") == Some(b"y".to_vec())
    }));
}

#[test]
fn writes_from_every_member_apply_in_identical_order() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 3);

    for round in 0u8..4 {
        for (index, node) in nodes.iter().enumerate() {
            let key = vec![b'k', round, index as u8];
            node.write(&key, b"v").unwrap();
        }
    }

    assert!(eventually(Duration::from_secs(15), || {
        nodes.iter().all(|node| node.db.applied_count() >= 12)
    }));

    // Total order: every member saw the same set of keys.
    for round in 0u8..4 {
        for index in 0..3u8 {
            let key = vec![b'k', round, index];
            for node in &nodes {
                assert_eq!(node.db.get(&key), Some(b"v".to_vec()));
            }
        }
    }
}
