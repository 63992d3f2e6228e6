//! Shared helpers for recovery integration tests.
//!
//! Tests run full nodes in-process: every node gets its own listener,
//! runtime and data directory, all wired to one shared in-memory
//! coordination store. Cores can be pre-seeded on disk before their node
//! starts, so a test can stage "what the replica held when it went down".

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strata_coord::{paths, CoordStore, CreateMode, MemCoordStore};
use strata_search::cluster::{ReplicaState, ReplicaType};
use strata_search::config::RecoveryTuning;
use strata_search::core::ReplicaCore;
use strata_search::index::IndexCore;
use strata_search::node::{start_node_with_tuning, CoreSpec, NodeArgs, NodeHandle};
use strata_search::update_log::{LogEntry, UpdateLog};
use strata_search::Runtime;

/// Upper bound for cluster convergence in tests.
pub const CLUSTER_WAIT: Duration = Duration::from_secs(20);

/// One embedded node hosting a single replica core.
pub struct ShardNode {
    pub handle: NodeHandle,
    pub collection: String,
    pub core_name: String,
}

impl ShardNode {
    pub fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.handle.runtime)
    }

    pub fn core(&self) -> Arc<ReplicaCore> {
        self.handle
            .runtime
            .core(&self.core_name)
            .expect("core registered")
    }

    pub fn node_name(&self) -> String {
        self.handle.runtime.node_name.clone()
    }

    pub fn base_url(&self) -> String {
        self.handle.base_url()
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }
}

/// Directory a node stores its data under.
pub fn node_data_dir(data_root: &Path, core_name: &str) -> PathBuf {
    data_root.join(format!("{core_name}_node"))
}

/// Directory a core lives in within its node's data dir.
pub fn core_dir(data_root: &Path, core_name: &str) -> PathBuf {
    node_data_dir(data_root, core_name).join(core_name)
}

/// Standard test document for a given version.
pub fn doc(version: i64) -> LogEntry {
    LogEntry::add(
        version,
        serde_json::json!({"id": format!("doc{version}"), "v": version}),
    )
}

/// Stage a core's on-disk state before its node starts: the given versions
/// are appended to the tlog and committed to the index, as if the replica
/// had gone down holding them.
pub fn seed_core(data_root: &Path, core_name: &str, versions: &[i64]) {
    let dir = core_dir(data_root, core_name);
    let ulog = UpdateLog::open(dir.join("tlog"), 100).expect("open tlog for seeding");
    let index = IndexCore::open(dir.join("index")).expect("open index for seeding");
    for version in versions {
        let entry = doc(*version);
        ulog.append_update(entry.clone()).expect("seed tlog entry");
        index.apply(&entry);
    }
    index.commit(false).expect("seed commit");
}

/// Start one node hosting one core. Nodes must be started in election
/// order: the first joiner of a shard's queue is its leader.
pub async fn start_shard_node(
    store: &Arc<MemCoordStore>,
    data_root: &Path,
    collection: &str,
    shard: &str,
    core_name: &str,
    replica_id: u32,
    replica_type: ReplicaType,
) -> ShardNode {
    start_shard_node_with_tuning(
        store,
        data_root,
        collection,
        shard,
        core_name,
        replica_id,
        replica_type,
        RecoveryTuning::default(),
    )
    .await
}

pub async fn start_shard_node_with_tuning(
    store: &Arc<MemCoordStore>,
    data_root: &Path,
    collection: &str,
    shard: &str,
    core_name: &str,
    replica_id: u32,
    replica_type: ReplicaType,
    tuning: RecoveryTuning,
) -> ShardNode {
    let args = NodeArgs {
        node_name: None,
        listen_http: "127.0.0.1:0".parse().expect("listen addr"),
        data_dir: node_data_dir(data_root, core_name),
        cores: vec![CoreSpec {
            collection: collection.to_string(),
            shard: shard.to_string(),
            name: core_name.to_string(),
            replica_id,
            replica_type,
        }],
        recover_on_start: false,
    };
    let coord: Arc<dyn CoordStore> = Arc::clone(store) as Arc<dyn CoordStore>;
    let handle = start_node_with_tuning(args, coord, tuning)
        .await
        .expect("start embedded node");
    ShardNode {
        handle,
        collection: collection.to_string(),
        core_name: core_name.to_string(),
    }
}

/// A replica row for the bootstrap `state.json`.
pub struct ReplicaEntry {
    pub name: String,
    pub id: u32,
    pub node: String,
    pub base_url: String,
    pub replica_type: &'static str,
    pub state: &'static str,
}

pub fn replica_entry(node: &ShardNode, replica_id: u32, rtype: &'static str, state: &'static str) -> ReplicaEntry {
    ReplicaEntry {
        name: node.core_name.clone(),
        id: replica_id,
        node: node.node_name(),
        base_url: node.base_url(),
        replica_type: rtype,
        state,
    }
}

/// Write (or bump) the collection's `state.json` in the store.
pub async fn write_collection_state(
    store: &Arc<MemCoordStore>,
    collection: &str,
    shard: &str,
    entries: &[ReplicaEntry],
) {
    let mut replicas = serde_json::Map::new();
    for entry in entries {
        replicas.insert(
            entry.name.clone(),
            serde_json::json!({
                "id": entry.id,
                "node": entry.node,
                "base_url": entry.base_url,
                "type": entry.replica_type,
                "state": entry.state,
            }),
        );
    }
    let mut shards = serde_json::Map::new();
    shards.insert(
        shard.to_string(),
        serde_json::json!({ "state": "active", "replicas": replicas }),
    );
    let document = serde_json::json!({
        "name": collection,
        "shards": shards,
    });
    let path = paths::collection_state(collection);
    let data = serde_json::to_vec(&document).expect("serialize state.json");
    match store.exists(&path).await.expect("state.json exists check") {
        Some(_) => {
            store
                .set_data(&path, data, None)
                .await
                .expect("bump state.json");
        }
        None => {
            store
                .create(&path, data, CreateMode::Persistent)
                .await
                .expect("create state.json");
        }
    }
}

/// Wait until a node's projection shows the replica in the given state.
pub async fn wait_replica_state(
    node: &ShardNode,
    replica_name: &str,
    expected: ReplicaState,
) -> bool {
    let name = replica_name.to_string();
    node.runtime()
        .state_reader
        .wait_for_state(&node.collection, CLUSTER_WAIT, move |_live, coll| {
            coll.and_then(|c| c.replica_by_name(&name))
                .map(|rep| rep.state == expected)
                .unwrap_or(false)
        })
        .await
}

/// Fingerprint equality between two cores at head.
pub fn in_sync(a: &ShardNode, b: &ShardNode) -> bool {
    let fa = strata_search::fingerprint::compute(&a.core().index, i64::MAX);
    let fb = strata_search::fingerprint::compute(&b.core().index, i64::MAX);
    strata_search::fingerprint::equal(&fa, &fb)
}

/// Tuning profile for tests that exercise the retry ladder.
pub fn fast_retry_tuning(max_retries: u32) -> RecoveryTuning {
    RecoveryTuning {
        max_retries,
        starting_recovery_delay: Duration::from_millis(10),
        prep_recovery_timeout: Duration::from_secs(2),
        leader_resolve_timeout: Duration::from_secs(2),
        ..RecoveryTuning::default()
    }
}
