//! Process-wide context threaded through every component explicitly: the
//! shared HTTP client pool, the coordination-store handle, the cluster-state
//! reader, the state publisher, and the registry of cores mounted on this
//! node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use strata_coord::{paths, CoordError, CoordStore, CreateMode, SessionState};
use tokio::sync::watch;

use crate::config::RecoveryTuning;
use crate::core::ReplicaCore;
use crate::election::LeaderElector;
use crate::leader_client::LeaderClient;
use crate::publisher::StatePublisher;
use crate::state_reader::StateReader;

/// Shared node context. One per node process (or per embedded node in
/// tests); nothing in this crate reaches for module-level state.
pub struct Runtime {
    pub node_name: String,
    pub base_url: String,
    pub store: Arc<dyn CoordStore>,
    pub state_reader: Arc<StateReader>,
    pub publisher: StatePublisher,
    pub client: LeaderClient,
    pub tuning: RecoveryTuning,
    session: watch::Receiver<SessionState>,
    cores: RwLock<HashMap<String, Arc<ReplicaCore>>>,
    electors: RwLock<HashMap<String, Arc<LeaderElector>>>,
    closing: AtomicBool,
}

impl Runtime {
    pub fn new(
        node_name: &str,
        base_url: &str,
        store: Arc<dyn CoordStore>,
        tuning: RecoveryTuning,
    ) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .build()
            .context("build shared http client")?;
        let client = LeaderClient::new(http, tuning.fetch_idle_timeout);
        let state_reader = StateReader::new(Arc::clone(&store));
        let publisher = StatePublisher::new(Arc::clone(&store));
        let session = store.session();
        Ok(Arc::new(Self {
            node_name: node_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            state_reader,
            publisher,
            client,
            tuning,
            session,
            cores: RwLock::new(HashMap::new()),
            electors: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }))
    }

    /// Announce this node as live.
    pub async fn register_live_node(&self) -> anyhow::Result<()> {
        let path = paths::live_node(&self.node_name);
        match self
            .store
            .create(&path, Vec::new(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) | Err(CoordError::NodeExists(_)) => Ok(()),
            Err(err) => Err(err).context("register live node"),
        }
    }

    /// Mount a core: register it, join its shard's election, and start
    /// watching its collection.
    pub async fn register_core(&self, core: Arc<ReplicaCore>) -> anyhow::Result<Arc<LeaderElector>> {
        let elector = Arc::new(LeaderElector::new(
            Arc::clone(&self.store),
            &core.collection,
            &core.shard,
            &core.name,
            core.replica_id,
        ));
        self.state_reader.watch_collection(&core.collection);
        elector.join_and_publish(&self.publisher).await?;
        self.electors
            .write()
            .unwrap()
            .insert(core.name.clone(), Arc::clone(&elector));
        self.cores
            .write()
            .unwrap()
            .insert(core.name.clone(), core);
        Ok(elector)
    }

    /// Look up a mounted core. `None` means "not ready": callers surface a
    /// retryable error instead of polling a loading flag.
    pub fn core(&self, name: &str) -> Option<Arc<ReplicaCore>> {
        self.cores.read().unwrap().get(name).cloned()
    }

    pub fn cores(&self) -> Vec<Arc<ReplicaCore>> {
        self.cores.read().unwrap().values().cloned().collect()
    }

    pub fn elector(&self, core_name: &str) -> Option<Arc<LeaderElector>> {
        self.electors.read().unwrap().get(core_name).cloned()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn session_expired(&self) -> bool {
        *self.session.borrow() == SessionState::Expired
    }

    /// Begin node shutdown: all recovery attempts and background loops
    /// observe this and exit without publishing.
    pub fn begin_shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        for core in self.cores() {
            core.close();
        }
        self.state_reader.close();
        self.publisher.close();
    }
}
