//! Cluster metadata: collections, shards, replicas, and the merge rules for
//! keeping a live projection of them.
//!
//! A collection document arrives either whole (a new `state.json` with a new
//! version) or as a small per-replica state delta keyed by replica id. Both
//! paths must preserve the invariant that a shard has at most one LEADER.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Stable numeric replica identity; state-update deltas key off this.
pub type ReplicaId = u32;

/// Replica lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Down,
    Leader,
    Recovering,
    Active,
    Buffering,
    RecoveryFailed,
}

impl ReplicaState {
    /// Small wire code used in the state-updates delta blob.
    pub fn code(self) -> u8 {
        match self {
            ReplicaState::Down => 0,
            ReplicaState::Leader => 1,
            ReplicaState::Recovering => 2,
            ReplicaState::Active => 3,
            ReplicaState::Buffering => 4,
            ReplicaState::RecoveryFailed => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReplicaState::Down),
            1 => Some(ReplicaState::Leader),
            2 => Some(ReplicaState::Recovering),
            3 => Some(ReplicaState::Active),
            4 => Some(ReplicaState::Buffering),
            5 => Some(ReplicaState::RecoveryFailed),
            _ => None,
        }
    }
}

/// Replica flavor. The flavors differ only in whether they keep a
/// transaction log and whether they replicate segments in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaType {
    /// Indexes locally, near-real-time.
    Nrt,
    /// Buffers writes to the log, pulls segments from the leader.
    Tlog,
    /// No writes at all, replication only.
    Pull,
}

impl ReplicaType {
    pub fn uses_update_log(self) -> bool {
        !matches!(self, ReplicaType::Pull)
    }

    pub fn background_replication(self) -> bool {
        matches!(self, ReplicaType::Tlog | ReplicaType::Pull)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Active,
    Inactive,
    Construction,
    Recovery,
}

/// One replica of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub id: ReplicaId,
    pub name: String,
    /// Node identity (`host:port`).
    pub node: String,
    pub base_url: String,
    pub replica_type: ReplicaType,
    pub state: ReplicaState,
    /// Name of the owning shard.
    pub shard: String,
}

impl Replica {
    /// URL of this replica's core endpoints on its node.
    pub fn core_url(&self) -> String {
        format!("{}/cores/{}", self.base_url.trim_end_matches('/'), self.name)
    }
}

/// A partition of a collection. Holds replica ids; the replicas themselves
/// live in the collection's arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    pub state: ShardState,
    pub replica_ids: Vec<ReplicaId>,
    pub leader: Option<ReplicaId>,
}

/// In-memory projection of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    /// Version of the `state.json` document this projection is built from.
    pub version: i64,
    /// Version of the last applied state-updates delta blob.
    pub state_updates_version: i64,
    pub shards: BTreeMap<String, Shard>,
    pub replicas: BTreeMap<ReplicaId, Replica>,
}

impl Collection {
    /// Build a projection from a `state.json` document.
    ///
    /// Normalizes leadership on load: if the document lists several LEADER
    /// replicas in one shard, the last one listed wins and the rest are
    /// demoted to RECOVERING, matching what the delta path would do.
    pub fn from_doc_bytes(name: &str, version: i64, data: &[u8]) -> anyhow::Result<Self> {
        let doc: CollectionDoc = serde_json::from_slice(data)
            .with_context(|| format!("parse state.json for collection {name}"))?;
        let mut shards = BTreeMap::new();
        let mut replicas: BTreeMap<ReplicaId, Replica> = BTreeMap::new();
        for (shard_name, shard_doc) in doc.shards {
            let mut replica_ids = Vec::with_capacity(shard_doc.replicas.len());
            let mut leader = None;
            for (replica_name, rep) in shard_doc.replicas {
                replica_ids.push(rep.id);
                if rep.state == ReplicaState::Leader {
                    if let Some(prev) = leader.replace(rep.id) {
                        // Last listed leader wins; demote the earlier one.
                        if let Some(prev_rep) = replicas.get_mut(&prev) {
                            prev_rep.state = ReplicaState::Recovering;
                        }
                    }
                }
                replicas.insert(
                    rep.id,
                    Replica {
                        id: rep.id,
                        name: replica_name,
                        node: rep.node,
                        base_url: rep.base_url,
                        replica_type: rep.replica_type,
                        state: rep.state,
                        shard: shard_name.clone(),
                    },
                );
            }
            replica_ids.sort_unstable();
            shards.insert(
                shard_name.clone(),
                Shard {
                    name: shard_name,
                    state: shard_doc.state,
                    replica_ids,
                    leader,
                },
            );
        }
        Ok(Self {
            name: name.to_string(),
            version,
            state_updates_version: -1,
            shards,
            replicas,
        })
    }

    /// Serialize back into the `state.json` document form.
    pub fn to_doc_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut shards = BTreeMap::new();
        for (shard_name, shard) in &self.shards {
            let mut reps = BTreeMap::new();
            for id in &shard.replica_ids {
                if let Some(rep) = self.replicas.get(id) {
                    reps.insert(
                        rep.name.clone(),
                        ReplicaDoc {
                            id: rep.id,
                            node: rep.node.clone(),
                            base_url: rep.base_url.clone(),
                            replica_type: rep.replica_type,
                            state: rep.state,
                        },
                    );
                }
            }
            shards.insert(
                shard_name.clone(),
                ShardDoc {
                    state: shard.state,
                    replicas: reps,
                },
            );
        }
        let doc = CollectionDoc {
            name: self.name.clone(),
            shards,
        };
        serde_json::to_vec_pretty(&doc).context("serialize state.json")
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.get(&id)
    }

    pub fn replica_by_name(&self, name: &str) -> Option<&Replica> {
        self.replicas.values().find(|rep| rep.name == name)
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.get(name)
    }

    /// The shard's LEADER replica, if any.
    pub fn leader_of(&self, shard: &str) -> Option<&Replica> {
        let shard = self.shards.get(shard)?;
        let id = shard.leader?;
        let rep = self.replicas.get(&id)?;
        if rep.state == ReplicaState::Leader {
            Some(rep)
        } else {
            None
        }
    }

    /// Set one replica's state, keeping the owning shard's leader pointer
    /// consistent.
    pub fn update_state(&mut self, id: ReplicaId, state: ReplicaState) {
        let shard_name = match self.replicas.get_mut(&id) {
            Some(rep) => {
                rep.state = state;
                rep.shard.clone()
            }
            None => return,
        };
        if let Some(shard) = self.shards.get_mut(&shard_name) {
            if state == ReplicaState::Leader {
                shard.leader = Some(id);
            } else if shard.leader == Some(id) {
                shard.leader = None;
            }
        }
    }

    /// Merge a state-updates delta blob into this projection.
    ///
    /// Deltas with a version at or below the last applied one are discarded.
    /// A replica transitioning to LEADER demotes every other LEADER in its
    /// shard before the entry is applied, so the single-leader invariant
    /// holds mid-sequence.
    pub fn apply_state_updates(
        &mut self,
        version: i64,
        updates: &BTreeMap<ReplicaId, u8>,
    ) -> bool {
        if version <= self.state_updates_version {
            tracing::debug!(
                collection = %self.name,
                delta_version = version,
                current = self.state_updates_version,
                "discarding stale state-updates delta"
            );
            return false;
        }
        for (&id, &code) in updates {
            let Some(state) = ReplicaState::from_code(code) else {
                tracing::warn!(collection = %self.name, replica = id, code, "unknown state code");
                continue;
            };
            if state == ReplicaState::Leader {
                let peers: Vec<ReplicaId> = self
                    .replicas
                    .get(&id)
                    .and_then(|rep| self.shards.get(&rep.shard))
                    .map(|shard| shard.replica_ids.clone())
                    .unwrap_or_default();
                for peer in peers {
                    if peer != id
                        && self.replicas.get(&peer).map(|r| r.state) == Some(ReplicaState::Leader)
                    {
                        self.update_state(peer, ReplicaState::Recovering);
                    }
                }
            }
            self.update_state(id, state);
        }
        self.state_updates_version = version;
        true
    }
}

/// Parse a state-updates delta blob: a JSON map of replica id to state code.
pub fn parse_state_updates(data: &[u8]) -> anyhow::Result<BTreeMap<ReplicaId, u8>> {
    let raw: BTreeMap<String, u8> =
        serde_json::from_slice(data).context("parse state-updates blob")?;
    let mut out = BTreeMap::new();
    for (key, code) in raw {
        let id: ReplicaId = key
            .parse()
            .with_context(|| format!("non-numeric replica id {key:?} in state-updates"))?;
        out.insert(id, code);
    }
    Ok(out)
}

/// Serialize a state-updates delta blob.
pub fn encode_state_updates(updates: &BTreeMap<ReplicaId, u8>) -> anyhow::Result<Vec<u8>> {
    let raw: BTreeMap<String, u8> = updates
        .iter()
        .map(|(id, code)| (id.to_string(), *code))
        .collect();
    serde_json::to_vec(&raw).context("serialize state-updates blob")
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionDoc {
    name: String,
    shards: BTreeMap<String, ShardDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShardDoc {
    state: ShardState,
    replicas: BTreeMap<String, ReplicaDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplicaDoc {
    id: ReplicaId,
    node: String,
    base_url: String,
    #[serde(rename = "type")]
    replica_type: ReplicaType,
    state: ReplicaState,
}
