//! Store layout helpers.
//!
//! ```text
//! /collections/<name>/state.json      full collection doc, versioned
//! /collections/<name>/state-updates   per-replica state delta blob, versioned
//! /collections/<name>/leaders/<shard> ordered ephemerals for election
//! /live_nodes/<node>                  ephemeral per live node
//! ```

pub const COLLECTIONS_ROOT: &str = "/collections";
pub const LIVE_NODES_ROOT: &str = "/live_nodes";

pub fn collection_root(collection: &str) -> String {
    format!("{COLLECTIONS_ROOT}/{collection}")
}

pub fn collection_state(collection: &str) -> String {
    format!("{COLLECTIONS_ROOT}/{collection}/state.json")
}

pub fn collection_state_updates(collection: &str) -> String {
    format!("{COLLECTIONS_ROOT}/{collection}/state-updates")
}

pub fn shard_election_root(collection: &str, shard: &str) -> String {
    format!("{COLLECTIONS_ROOT}/{collection}/leaders/{shard}")
}

pub fn shard_election_entry(collection: &str, shard: &str, replica: &str) -> String {
    format!("{COLLECTIONS_ROOT}/{collection}/leaders/{shard}/{replica}-n_")
}

pub fn live_node(node: &str) -> String {
    format!("{LIVE_NODES_ROOT}/{node}")
}

/// Split the election-queue suffix assigned by the store off an entry name,
/// returning `(replica, sequence)`.
pub fn parse_election_entry(name: &str) -> Option<(&str, u64)> {
    let (replica, seq) = name.rsplit_once("-n_")?;
    let seq = seq.parse().ok()?;
    Some((replica, seq))
}
