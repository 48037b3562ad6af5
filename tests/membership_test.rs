//! Membership under partition and merge: the majority side keeps the primary
//! component and keeps committing, the minority blocks writes, and on heal the
//! minority catches up through incremental state transfer from a donor.

mod common;

use std::time::Duration;

use log::LevelFilter;
use tandem::{MemberId, ReplicationError, ViewKind};

use common::logging::setup_logger;
use common::network::Hub;
use common::node::{eventually, start_cluster, TestNode};

fn ids_of(nodes: &[TestNode], indexes: &[usize]) -> Vec<MemberId> {
    indexes.iter().map(|index| nodes[*index].member_id).collect()
}

#[test]
fn split_blocks_the_minority_and_merge_catches_it_up_via_ist() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 5);

    nodes[0].write(b"pre-split", b"x").unwrap();
    assert!(eventually(Duration::from_secs(10), || {
        nodes.iter().all(|node| node.db.get(b"pre-split").is_some())
    }));

    // Partition {0,1} away from {2,3,4}.
    let minority = ids_of(&nodes, &[0, 1]);
    let majority = ids_of(&nodes, &[2, 3, 4]);
    hub.partition(&minority, &majority);

    // The majority re-forms a three-member primary component.
    assert!(
        eventually(Duration::from_secs(15), || {
            [2, 3, 4].iter().all(|index| {
                nodes[*index]
                    .db
                    .latest_view()
                    .map(|view| view.kind == ViewKind::Primary && view.members.len() == 3)
                    .unwrap_or(false)
            })
        }),
        "majority stays primary"
    );
    // The minority observes a non-primary two-member view.
    assert!(
        eventually(Duration::from_secs(15), || {
            [0, 1].iter().all(|index| {
                nodes[*index]
                    .db
                    .latest_view()
                    .map(|view| view.kind == ViewKind::NonPrimary && view.members.len() == 2)
                    .unwrap_or(false)
            })
        }),
        "minority loses the primary"
    );

    // Writes commit on the majority side and are refused on the minority side.
    nodes[2].write(b"majority-only", b"y").unwrap();
    nodes[3].write(b"majority-only-2", b"z").unwrap();
    assert!(eventually(Duration::from_secs(10), || {
        [2, 3, 4]
            .iter()
            .all(|index| nodes[*index].db.get(b"majority-only-2").is_some())
    }));

    assert_eq!(
        nodes[0].write(b"minority-write", b"w"),
        Err(ReplicationError::NotPrimary)
    );

    // Heal the partition: the five members merge, and the two that fell behind catch
    // up by replaying the missed range from a donor's cache.
    hub.heal(&minority, &majority);

    assert!(
        eventually(Duration::from_secs(20), || {
            nodes.iter().all(|node| {
                node.db
                    .latest_view()
                    .map(|view| view.kind == ViewKind::Primary && view.members.len() == 5)
                    .unwrap_or(false)
            })
        }),
        "all five members re-form a primary component"
    );

    assert!(
        eventually(Duration::from_secs(20), || {
            [0, 1].iter().all(|index| {
                nodes[*index].db.get(b"majority-only").is_some()
                    && nodes[*index].db.get(b"majority-only-2").is_some()
            })
        }),
        "rejoined members received the writes they missed"
    );
    // Catch-up went through incremental transfer, not a full snapshot.
    assert_eq!(nodes[0].db.snapshots_installed(), 0);
    assert_eq!(nodes[1].db.snapshots_installed(), 0);

    // The rejoined members replicate again (retried: the node accepts writes only
    // once its join/sync round has gone through the total order).
    assert!(eventually(Duration::from_secs(15), || {
        nodes[0].write(b"post-merge", b"v").is_ok()
    }));
    assert!(eventually(Duration::from_secs(10), || {
        nodes.iter().all(|node| node.db.get(b"post-merge").is_some())
    }));
}

#[test]
fn even_split_blocks_both_sides_until_merge() {
    setup_logger(LevelFilter::Info);
    let hub = Hub::new();
    let nodes = start_cluster(&hub, 4);

    let left = ids_of(&nodes, &[0, 1]);
    let right = ids_of(&nodes, &[2, 3]);
    hub.partition(&left, &right);

    assert!(
        eventually(Duration::from_secs(15), || {
            nodes.iter().all(|node| {
                node.db
                    .latest_view()
                    .map(|view| view.kind == ViewKind::NonPrimary)
                    .unwrap_or(false)
            })
        }),
        "neither half of an even split may commit"
    );
    assert_eq!(
        nodes[0].write(b"left", b"x"),
        Err(ReplicationError::NotPrimary)
    );
    assert_eq!(
        nodes[2].write(b"right", b"x"),
        Err(ReplicationError::NotPrimary)
    );

    hub.heal(&left, &right);
    assert!(
        eventually(Duration::from_secs(20), || {
            nodes.iter().all(|node| {
                node.db
                    .latest_view()
                    .map(|view| view.kind == ViewKind::Primary && view.members.len() == 4)
                    .unwrap_or(false)
            })
        }),
        "the merged cluster holds the full previous primary and recovers"
    );

    assert!(eventually(Duration::from_secs(15), || {
        nodes[0].write(b"after-merge", b"x").is_ok()
    }));
    assert!(eventually(Duration::from_secs(10), || {
        nodes.iter().all(|node| node.db.get(b"after-merge").is_some())
    }));
}
