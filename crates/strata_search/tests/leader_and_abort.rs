//! Leadership edge cases: a leader must not recover, a leader change
//! mid-recovery re-targets the new leader, a closed recovery aborts without
//! publishing, and an exhausted retry budget publishes RECOVERY_FAILED.

mod common;

use std::time::Duration;

use common::{
    fast_retry_tuning, in_sync, replica_entry, seed_core, start_shard_node,
    start_shard_node_with_tuning, wait_replica_state, write_collection_state, ReplicaEntry,
};
use strata_coord::{paths, CoordStore, CreateMode, MemCoordStore};
use strata_search::cluster::{ReplicaState, ReplicaType};
use strata_search::RecoveryOutcome;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn elected_leader_skips_recovery_and_publishes_leader() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    seed_core(data_root.path(), "solo_shard1_r1", &[1, 2]);
    let node = start_shard_node(
        &store,
        data_root.path(),
        "solo",
        "shard1",
        "solo_shard1_r1",
        1,
        ReplicaType::Nrt,
    )
    .await;
    write_collection_state(
        &store,
        "solo",
        "shard1",
        &[replica_entry(&node, 1, "NRT", "down")],
    )
    .await;

    // Sole member of the election queue: recovering would be illegal.
    node.core().start_recovery(node.runtime(), true, None);
    let outcome = node.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::SkippedIsLeader));
    assert!(wait_replica_state(&node, "solo_shard1_r1", ReplicaState::Leader).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_change_mid_recovery_converges_on_new_leader() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    for name in ["move_shard1_r1", "move_shard1_r2"] {
        seed_core(
            data_root.path(),
            name,
            &[97, 98, 99, 100, 101, 102, 103],
        );
    }
    seed_core(data_root.path(), "move_shard1_r3", &[97, 98, 99, 100]);

    let old_leader = start_shard_node(
        &store,
        data_root.path(),
        "move",
        "shard1",
        "move_shard1_r1",
        1,
        ReplicaType::Nrt,
    )
    .await;
    let new_leader = start_shard_node(
        &store,
        data_root.path(),
        "move",
        "shard1",
        "move_shard1_r2",
        2,
        ReplicaType::Nrt,
    )
    .await;
    let follower = start_shard_node(
        &store,
        data_root.path(),
        "move",
        "shard1",
        "move_shard1_r3",
        3,
        ReplicaType::Nrt,
    )
    .await;

    write_collection_state(
        &store,
        "move",
        "shard1",
        &[
            replica_entry(&old_leader, 1, "NRT", "leader"),
            replica_entry(&new_leader, 2, "NRT", "active"),
            replica_entry(&follower, 3, "NRT", "down"),
        ],
    )
    .await;

    // The old leader loses its election seat before the follower starts;
    // the projection still names it leader, so the first attempts target a
    // leader that refuses prep-recovery.
    old_leader
        .runtime()
        .elector("move_shard1_r1")
        .expect("old leader elector")
        .resign()
        .await;

    follower
        .core()
        .start_recovery(follower.runtime(), true, None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let promoted = new_leader
        .runtime()
        .elector("move_shard1_r2")
        .expect("new leader elector")
        .join_and_publish(&new_leader.runtime().publisher)
        .await
        .expect("promote new leader");
    assert!(promoted, "second joiner must win after the first resigns");

    let outcome = follower.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::Recovered));
    assert!(in_sync(&new_leader, &follower), "fingerprints must match");
    assert!(wait_replica_state(&follower, "move_shard1_r3", ReplicaState::Active).await);

    let projection = follower
        .runtime()
        .state_reader
        .get_collection("move")
        .expect("projection");
    assert_eq!(
        projection.leader_of("shard1").map(|rep| rep.id),
        Some(2),
        "projection must name the new leader"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_recovery_aborts_without_publishing() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    // Someone else holds the election seat, and no leader ever shows up in
    // the projection: recovery blocks resolving one.
    store
        .create(
            &paths::shard_election_entry("halt", "shard1", "halt_shard1_r1"),
            Vec::new(),
            CreateMode::EphemeralSequential,
        )
        .await
        .expect("occupy election seat");

    seed_core(data_root.path(), "halt_shard1_r2", &[1, 2, 3]);
    let node = start_shard_node(
        &store,
        data_root.path(),
        "halt",
        "shard1",
        "halt_shard1_r2",
        2,
        ReplicaType::Nrt,
    )
    .await;
    write_collection_state(
        &store,
        "halt",
        "shard1",
        &[replica_entry(&node, 2, "NRT", "down")],
    )
    .await;
    assert!(wait_replica_state(&node, "halt_shard1_r2", ReplicaState::Down).await);

    node.core().start_recovery(node.runtime(), true, None);
    tokio::time::sleep(Duration::from_millis(200)).await;
    node.core().cancel_recovery();

    let outcome = node.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::AbortedClosing));
    // Nothing was published: the replica is still DOWN in the projection.
    assert_eq!(
        node.runtime()
            .state_reader
            .replica_state("halt", "halt_shard1_r2"),
        Some(ReplicaState::Down)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_publish_recovery_failed_once() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    // A ghost leader: first in the election queue, listed live and LEADER
    // in the cluster state, but its address refuses every connection.
    store
        .create(
            &paths::shard_election_entry("fail", "shard1", "fail_shard1_r1"),
            Vec::new(),
            CreateMode::EphemeralSequential,
        )
        .await
        .expect("ghost election seat");
    store
        .create(
            &paths::live_node("ghost:1"),
            Vec::new(),
            CreateMode::Ephemeral,
        )
        .await
        .expect("ghost live node");

    seed_core(data_root.path(), "fail_shard1_r2", &[1, 2, 3]);
    let node = start_shard_node_with_tuning(
        &store,
        data_root.path(),
        "fail",
        "shard1",
        "fail_shard1_r2",
        2,
        ReplicaType::Nrt,
        fast_retry_tuning(3),
    )
    .await;

    let ghost = ReplicaEntry {
        name: "fail_shard1_r1".to_string(),
        id: 1,
        node: "ghost:1".to_string(),
        base_url: "http://127.0.0.1:1".to_string(),
        replica_type: "NRT",
        state: "leader",
    };
    write_collection_state(
        &store,
        "fail",
        "shard1",
        &[ghost, replica_entry(&node, 2, "NRT", "down")],
    )
    .await;

    node.core().start_recovery(node.runtime(), true, None);
    let outcome = node.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::FailedMaxRetries));
    assert!(
        wait_replica_state(&node, "fail_shard1_r2", ReplicaState::RecoveryFailed).await,
        "RECOVERY_FAILED must be published"
    );
    assert!(
        !node.core().recovery_running(),
        "no further retries fire until recovery is re-triggered"
    );
}
