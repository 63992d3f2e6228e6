//! Per-shard leader election over an ordered ephemeral queue.
//!
//! Each contender appends an ephemeral-sequential entry under the shard's
//! election path; the lowest live sequence is the leader. Entries vanish
//! with their session, so leadership follows liveness. The winner announces
//! itself through the state publisher.

use std::sync::Arc;

use anyhow::Context;
use strata_coord::{paths, CoordError, CoordStore, CreateMode};
use tokio::sync::Mutex;

use crate::cluster::{ReplicaId, ReplicaState};
use crate::publisher::StatePublisher;

/// One replica's stake in its shard's election.
pub struct LeaderElector {
    store: Arc<dyn CoordStore>,
    collection: String,
    shard: String,
    replica_name: String,
    replica_id: ReplicaId,
    entry: Mutex<Option<String>>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn CoordStore>,
        collection: &str,
        shard: &str,
        replica_name: &str,
        replica_id: ReplicaId,
    ) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            shard: shard.to_string(),
            replica_name: replica_name.to_string(),
            replica_id,
            entry: Mutex::new(None),
        }
    }

    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// Enter the election queue. Idempotent while our entry is still live.
    pub async fn join(&self) -> anyhow::Result<()> {
        let mut entry = self.entry.lock().await;
        if let Some(existing) = entry.as_ref() {
            match self.store.exists(existing).await {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => {}
                Err(CoordError::SessionExpired) => {}
                Err(err) => return Err(err).context("check election entry"),
            }
        }
        let path =
            paths::shard_election_entry(&self.collection, &self.shard, &self.replica_name);
        let created = self
            .store
            .create(&path, Vec::new(), CreateMode::EphemeralSequential)
            .await
            .context("join election queue")?;
        tracing::debug!(
            collection = %self.collection,
            shard = %self.shard,
            entry = %created,
            "joined shard election"
        );
        *entry = Some(created);
        Ok(())
    }

    /// Leave the election queue.
    pub async fn resign(&self) {
        let mut entry = self.entry.lock().await;
        if let Some(existing) = entry.take() {
            if let Err(err) = self.store.delete(&existing).await {
                tracing::debug!(entry = %existing, error = %err, "election entry removal failed");
            }
        }
    }

    /// The replica name currently first in the queue.
    pub async fn current_leader(&self) -> Option<String> {
        let root = paths::shard_election_root(&self.collection, &self.shard);
        let children = match self.store.children(&root).await {
            Ok(children) => children,
            Err(_) => return None,
        };
        children
            .iter()
            .filter_map(|name| paths::parse_election_entry(name))
            .min_by_key(|(_, seq)| *seq)
            .map(|(replica, _)| replica.to_string())
    }

    /// Local leadership check: are we first in the queue right now?
    ///
    /// It is illegal for a leader to run recovery, so every recovery phase
    /// consults this before proceeding.
    pub async fn is_leader(&self) -> bool {
        match self.current_leader().await {
            Some(leader) => leader == self.replica_name,
            None => false,
        }
    }

    /// Join and, if we won, declare leadership in the cluster state.
    pub async fn join_and_publish(&self, publisher: &StatePublisher) -> anyhow::Result<bool> {
        self.join().await?;
        if self.is_leader().await {
            publisher.publish(&self.collection, self.replica_id, ReplicaState::Leader);
            return Ok(true);
        }
        Ok(false)
    }
}
