//! Delta-catch-up recovery scenarios: a follower a few updates behind its
//! leader syncs exactly the missing updates, honors the delete-in-gap rule,
//! treats a repeated recovery as a no-op, and takes the same delta path for
//! TLOG replicas as for NRT.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{
    doc, in_sync, replica_entry, seed_core, start_shard_node, wait_replica_state,
    write_collection_state,
};
use strata_coord::MemCoordStore;
use strata_search::cluster::{ReplicaState, ReplicaType};
use strata_search::update_log::LogEntry;
use strata_search::{RecoveryListener, RecoveryOutcome};

#[derive(Default)]
struct OutcomeProbe {
    recovered: AtomicBool,
    failed: AtomicBool,
}

impl RecoveryListener for OutcomeProbe {
    fn recovered(&self) {
        self.recovered.store(true, Ordering::SeqCst);
    }

    fn failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_catches_up_via_peer_sync() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    // Both replicas went down holding versions 97..=100.
    seed_core(data_root.path(), "orders_shard1_r1", &[97, 98, 99, 100]);
    seed_core(data_root.path(), "orders_shard1_r2", &[97, 98, 99, 100]);

    let leader = start_shard_node(
        &store,
        data_root.path(),
        "orders",
        "shard1",
        "orders_shard1_r1",
        1,
        ReplicaType::Nrt,
    )
    .await;
    let follower = start_shard_node(
        &store,
        data_root.path(),
        "orders",
        "shard1",
        "orders_shard1_r2",
        2,
        ReplicaType::Nrt,
    )
    .await;

    write_collection_state(
        &store,
        "orders",
        "shard1",
        &[
            replica_entry(&leader, 1, "NRT", "leader"),
            replica_entry(&follower, 2, "NRT", "down"),
        ],
    )
    .await;

    // The leader moved on while the follower was down.
    for version in [101, 102, 103] {
        leader.core().ingest(doc(version)).unwrap();
    }

    let probe = Arc::new(OutcomeProbe::default());
    follower
        .core()
        .start_recovery(follower.runtime(), true, Some(probe.clone()));
    let outcome = follower.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::Recovered));
    assert!(probe.recovered.load(Ordering::SeqCst));
    assert!(!probe.failed.load(Ordering::SeqCst));

    let ulog = follower.core().require_ulog().unwrap();
    assert_eq!(
        ulog.recent_versions(10),
        vec![103, 102, 101, 100, 99, 98, 97]
    );
    assert!(in_sync(&leader, &follower), "fingerprints must match");
    assert!(follower.core().index.get_doc("doc103").is_some());

    assert!(wait_replica_state(&follower, "orders_shard1_r2", ReplicaState::Active).await);
    assert!(wait_replica_state(&leader, "orders_shard1_r2", ReplicaState::Active).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tlog_follower_starts_with_peer_sync() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    seed_core(data_root.path(), "ship_shard1_r1", &[97, 98, 99, 100]);
    seed_core(data_root.path(), "ship_shard1_r2", &[97, 98, 99, 100]);

    let leader = start_shard_node(
        &store,
        data_root.path(),
        "ship",
        "shard1",
        "ship_shard1_r1",
        1,
        ReplicaType::Nrt,
    )
    .await;
    let follower = start_shard_node(
        &store,
        data_root.path(),
        "ship",
        "shard1",
        "ship_shard1_r2",
        2,
        ReplicaType::Tlog,
    )
    .await;
    // Keep the periodic fetch loop out of the way so the catch-up below is
    // attributable to recovery alone.
    follower.core().stop_background_replication();

    write_collection_state(
        &store,
        "ship",
        "shard1",
        &[
            replica_entry(&leader, 1, "NRT", "leader"),
            replica_entry(&follower, 2, "TLOG", "down"),
        ],
    )
    .await;

    for version in [101, 102, 103] {
        leader.core().ingest(doc(version)).unwrap();
    }

    follower
        .core()
        .start_recovery(follower.runtime(), true, None);
    let outcome = follower.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::Recovered));

    // A full copy would have replaced segments without appending anything
    // to the log; the missed versions landing in the log proves the delta
    // path ran first.
    let ulog = follower.core().require_ulog().unwrap();
    assert_eq!(
        ulog.recent_versions(10),
        vec![103, 102, 101, 100, 99, 98, 97]
    );
    assert!(in_sync(&leader, &follower), "fingerprints must match");
    assert!(wait_replica_state(&follower, "ship_shard1_r2", ReplicaState::Active).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_in_gap_forces_full_application() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    // The follower went down one committed update behind the leader.
    seed_core(data_root.path(), "gap_shard1_r1", &[148, 149, 150]);
    seed_core(data_root.path(), "gap_shard1_r2", &[148, 149]);

    let leader = start_shard_node(
        &store,
        data_root.path(),
        "gap",
        "shard1",
        "gap_shard1_r1",
        1,
        ReplicaType::Nrt,
    )
    .await;
    let follower = start_shard_node(
        &store,
        data_root.path(),
        "gap",
        "shard1",
        "gap_shard1_r2",
        2,
        ReplicaType::Nrt,
    )
    .await;

    write_collection_state(
        &store,
        "gap",
        "shard1",
        &[
            replica_entry(&leader, 1, "NRT", "leader"),
            replica_entry(&follower, 2, "NRT", "down"),
        ],
    )
    .await;

    // The leader's log holds 151 (add) and -152 (delete of that same doc)
    // but neither has reached its index: its fingerprint stops at 150.
    let leader_ulog = leader.core().require_ulog().unwrap();
    leader_ulog.append_synced(doc(151)).unwrap();
    leader_ulog
        .append_synced(LogEntry::delete(-152, "doc151"))
        .unwrap();

    follower
        .core()
        .start_recovery(follower.runtime(), true, None);
    let outcome = follower.core().wait_recovery().await;
    assert_eq!(outcome, Some(RecoveryOutcome::Recovered));

    // Because a delete sits in the gap, both gap entries were applied rather
    // than pruned: the add and its delete cancel out.
    let follower_ulog = follower.core().require_ulog().unwrap();
    let versions = follower_ulog.recent_versions(10);
    assert!(versions.contains(&151), "gap add applied, got {versions:?}");
    assert!(
        versions.contains(&-152),
        "gap delete applied, got {versions:?}"
    );
    assert!(follower.core().index.get_doc("doc151").is_none());
    assert!(in_sync(&leader, &follower), "fingerprints must match");
    assert!(wait_replica_state(&follower, "gap_shard1_r2", ReplicaState::Active).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_recovery_on_caught_up_replica_is_a_noop() {
    let store = MemCoordStore::shared();
    let data_root = tempfile::tempdir().unwrap();

    seed_core(data_root.path(), "idem_shard1_r1", &[10, 11, 12]);
    seed_core(data_root.path(), "idem_shard1_r2", &[10, 11, 12]);

    let leader = start_shard_node(
        &store,
        data_root.path(),
        "idem",
        "shard1",
        "idem_shard1_r1",
        1,
        ReplicaType::Nrt,
    )
    .await;
    let follower = start_shard_node(
        &store,
        data_root.path(),
        "idem",
        "shard1",
        "idem_shard1_r2",
        2,
        ReplicaType::Nrt,
    )
    .await;

    write_collection_state(
        &store,
        "idem",
        "shard1",
        &[
            replica_entry(&leader, 1, "NRT", "leader"),
            replica_entry(&follower, 2, "NRT", "down"),
        ],
    )
    .await;

    let core = follower.core();
    core.start_recovery(follower.runtime(), true, None);
    assert_eq!(core.wait_recovery().await, Some(RecoveryOutcome::Recovered));
    let versions_after_first = core.require_ulog().unwrap().recent_versions(10);

    // Second run: already in sync, the fingerprint probe short-circuits and
    // nothing is fetched.
    core.start_recovery(follower.runtime(), false, None);
    assert_eq!(core.wait_recovery().await, Some(RecoveryOutcome::Recovered));

    let versions_after_second = core.require_ulog().unwrap().recent_versions(10);
    assert_eq!(versions_after_first, versions_after_second);
    assert!(in_sync(&leader, &follower));
    assert!(wait_replica_state(&follower, "idem_shard1_r2", ReplicaState::Active).await);
}
