//! Sharded search-index node: the replica recovery core and its supporting
//! state transport.
//!
//! A node mounts one or more replica cores, keeps a live projection of the
//! cluster state from the coordination store, and serves the leader side of
//! the recovery wire protocol. When one of its replicas has to catch back up
//! before going ACTIVE, the node runs the follower side: peer sync, full
//! index replication, and buffered replay.

pub mod cluster;
pub mod config;
pub mod core;
pub mod election;
pub mod fingerprint;
pub mod http_api;
pub mod index;
pub mod index_fetcher;
pub mod leader_client;
pub mod node;
pub mod peer_sync;
pub mod publisher;
pub mod recovery;
pub mod runtime;
pub mod state_reader;
pub mod update_log;

pub use cluster::{Collection, Replica, ReplicaId, ReplicaState, ReplicaType, Shard, ShardState};
pub use config::RecoveryTuning;
pub use self::core::{CoreDescriptor, ReplicaCore};
pub use fingerprint::Fingerprint;
pub use node::{start_node, NodeArgs, NodeHandle};
pub use recovery::{RecoveryListener, RecoveryOutcome};
pub use runtime::Runtime;
pub use update_log::{LogEntry, UpdateLog, UpdatesSpec};
