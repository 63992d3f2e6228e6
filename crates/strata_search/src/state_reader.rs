//! Live cluster-state projection fed by a single coalescing fetch worker.
//!
//! All projection updates flow through one worker that owns a queue of fetch
//! requests. The worker polls with a short wait, coalesces everything queued
//! into one batch per collection, and applies either a full `state.json`
//! replacement or a state-updates delta merge. Observers read lock-free
//! snapshots and can block on a predicate with `wait_for_state`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use strata_coord::store::WatchCallback;
use strata_coord::{paths, CoordError, CoordStore, RetryPolicy};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

use crate::cluster::{parse_state_updates, Collection, Replica, ReplicaState};

/// First-poll wait when the queue is idle.
const IDLE_POLL: Duration = Duration::from_secs(5);
/// Drain wait while building a batch.
const BATCH_POLL: Duration = Duration::from_millis(20);
/// Upper bound on one wait slice in `wait_for_state`; bounds the latency of
/// a wakeup that slips between predicate check and waiter registration.
const WAIT_SLICE: Duration = Duration::from_millis(250);

enum FetchRequest {
    Collection { name: String, just_states: bool },
    LiveNodes,
    Shutdown,
}

#[derive(Default)]
struct Projection {
    collections: HashMap<String, Arc<Collection>>,
    live_nodes: HashSet<String>,
}

/// One fire-once store watch that the worker re-arms after each firing.
struct WatchSlot {
    path: String,
    just_states: bool,
    armed: Arc<AtomicBool>,
}

/// Reader half of the cluster-state transport.
pub struct StateReader {
    weak: Weak<StateReader>,
    store: Arc<dyn CoordStore>,
    projection: RwLock<Projection>,
    changed: Notify,
    tx: mpsc::UnboundedSender<FetchRequest>,
    watch_slots: Mutex<HashMap<String, Vec<WatchSlot>>>,
    retry: RetryPolicy,
}

impl StateReader {
    pub fn new(store: Arc<dyn CoordStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            store,
            projection: RwLock::new(Projection::default()),
            changed: Notify::new(),
            tx,
            watch_slots: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
        });
        let worker = Arc::clone(&reader);
        tokio::spawn(async move { worker.run(rx).await });
        let _ = reader.tx.send(FetchRequest::LiveNodes);
        reader
    }

    /// Start receiving updates for a collection. Idempotent.
    pub fn watch_collection(&self, name: &str) {
        {
            let mut slots = self.watch_slots.lock().unwrap();
            if slots.contains_key(name) {
                return;
            }
            slots.insert(
                name.to_string(),
                vec![
                    WatchSlot {
                        path: paths::collection_state(name),
                        just_states: false,
                        armed: Arc::new(AtomicBool::new(false)),
                    },
                    WatchSlot {
                        path: paths::collection_state_updates(name),
                        just_states: true,
                        armed: Arc::new(AtomicBool::new(false)),
                    },
                ],
            );
        }
        self.request_update(name, false);
    }

    /// Enqueue a fetch: `just_states` fetches only the delta blob.
    pub fn request_update(&self, name: &str, just_states: bool) {
        let _ = self.tx.send(FetchRequest::Collection {
            name: name.to_string(),
            just_states,
        });
    }

    /// Lock-free snapshot of the latest projection for a collection.
    pub fn get_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.projection
            .read()
            .unwrap()
            .collections
            .get(name)
            .cloned()
    }

    pub fn live_nodes(&self) -> HashSet<String> {
        self.projection.read().unwrap().live_nodes.clone()
    }

    pub fn close(&self) {
        let _ = self.tx.send(FetchRequest::Shutdown);
    }

    /// Block until `predicate(live_nodes, collection)` holds or the timeout
    /// expires. The predicate is re-evaluated on every projection change.
    pub async fn wait_for_state<F>(&self, name: &str, wait: Duration, predicate: F) -> bool
    where
        F: Fn(&HashSet<String>, Option<&Collection>) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            {
                let projection = self.projection.read().unwrap();
                let collection = projection.collections.get(name).map(Arc::as_ref);
                if predicate(&projection.live_nodes, collection) {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            let _ = timeout(slice, self.changed.notified()).await;
        }
    }

    /// Resolve the shard's current live leader, waiting up to `wait` for one
    /// to show up in the projection.
    pub async fn get_leader_retry(
        &self,
        collection: &str,
        shard: &str,
        wait: Duration,
    ) -> anyhow::Result<Replica> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(leader) = self.live_leader(collection, shard) {
                return Ok(leader);
            }
            self.request_update(collection, true);
            let now = Instant::now();
            anyhow::ensure!(
                now < deadline,
                "no live leader for {collection}/{shard} within {wait:?}"
            );
            let slice = (deadline - now).min(WAIT_SLICE);
            let _ = timeout(slice, self.changed.notified()).await;
        }
    }

    fn live_leader(&self, collection: &str, shard: &str) -> Option<Replica> {
        let projection = self.projection.read().unwrap();
        let coll = projection.collections.get(collection)?;
        let leader = coll.leader_of(shard)?;
        if projection.live_nodes.contains(&leader.node) {
            Some(leader.clone())
        } else {
            None
        }
    }

    /// Current replica state as projected.
    pub fn replica_state(&self, collection: &str, replica_name: &str) -> Option<ReplicaState> {
        let coll = self.get_collection(collection)?;
        coll.replica_by_name(replica_name).map(|rep| rep.state)
    }

    // ---- worker ----

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FetchRequest>) {
        self.arm_live_nodes_watch().await;
        loop {
            let first = match timeout(IDLE_POLL, rx.recv()).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) => continue,
            };

            // Coalesce the burst: one entry per collection, a structure
            // fetch winning over states-only.
            let mut batch: HashMap<String, bool> = HashMap::new();
            let mut live_nodes = false;
            let mut shutdown = false;
            let mut add = |request: FetchRequest, live: &mut bool, stop: &mut bool| match request {
                FetchRequest::Collection { name, just_states } => {
                    batch
                        .entry(name)
                        .and_modify(|js| *js &= just_states)
                        .or_insert(just_states);
                }
                FetchRequest::LiveNodes => *live = true,
                FetchRequest::Shutdown => *stop = true,
            };
            add(first, &mut live_nodes, &mut shutdown);
            while !shutdown {
                match timeout(BATCH_POLL, rx.recv()).await {
                    Ok(Some(request)) => add(request, &mut live_nodes, &mut shutdown),
                    Ok(None) => {
                        shutdown = true;
                    }
                    Err(_) => break,
                }
            }
            drop(add);

            if live_nodes {
                self.refresh_live_nodes().await;
            }
            for (name, just_states) in batch {
                self.process_collection(&name, just_states).await;
            }
            if shutdown {
                break;
            }
        }
        tracing::info!("state reader worker terminated");
    }

    async fn process_collection(&self, name: &str, just_states: bool) {
        self.rearm_watches(name).await;

        let current = self.get_collection(name);
        let next = match current {
            Some(current) if just_states => self.merge_state_updates(current).await,
            _ => self.fetch_full(name).await,
        };

        if let Some(next) = next {
            let mut projection = self.projection.write().unwrap();
            projection.collections.insert(name.to_string(), next);
            drop(projection);
            self.changed.notify_waiters();
        }
    }

    /// Full `state.json` replacement; takes effect only when the incoming
    /// version is strictly greater than the projected one.
    async fn fetch_full(&self, name: &str) -> Option<Arc<Collection>> {
        let path = paths::collection_state(name);
        let store = Arc::clone(&self.store);
        let fetched = self
            .retry
            .run(|| {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move { store.get(&path).await }
            })
            .await;
        let (data, version) = match fetched {
            Ok(pair) => pair,
            Err(CoordError::NoNode(_)) => {
                tracing::debug!(collection = name, "no state.json yet");
                return None;
            }
            Err(err) => {
                tracing::error!(collection = name, error = %err, "state.json fetch failed");
                return None;
            }
        };
        let mut incoming = match Collection::from_doc_bytes(name, version, &data) {
            Ok(collection) => collection,
            Err(err) => {
                tracing::error!(collection = name, error = ?err, "state.json parse failed");
                return None;
            }
        };
        if let Some(current) = self.get_collection(name) {
            if incoming.version <= current.version {
                tracing::debug!(
                    collection = name,
                    incoming = incoming.version,
                    current = current.version,
                    "ignoring stale state.json"
                );
                return None;
            }
        }
        // Bring the fresh document up to date with any delta written since.
        self.apply_delta_blob(&mut incoming).await;
        Some(Arc::new(incoming))
    }

    /// Delta-only merge into a clone of the current projection.
    async fn merge_state_updates(&self, current: Arc<Collection>) -> Option<Arc<Collection>> {
        let mut next = (*current).clone();
        if self.apply_delta_blob(&mut next).await {
            Some(Arc::new(next))
        } else {
            None
        }
    }

    async fn apply_delta_blob(&self, collection: &mut Collection) -> bool {
        let path = paths::collection_state_updates(&collection.name);
        let (data, version) = match self.store.get(&path).await {
            Ok(pair) => pair,
            Err(CoordError::NoNode(_)) => return false,
            Err(err) => {
                tracing::warn!(collection = %collection.name, error = %err, "state-updates fetch failed");
                return false;
            }
        };
        let updates = match parse_state_updates(&data) {
            Ok(updates) => updates,
            Err(err) => {
                tracing::error!(collection = %collection.name, error = ?err, "state-updates parse failed");
                return false;
            }
        };
        collection.apply_state_updates(version, &updates)
    }

    async fn refresh_live_nodes(&self) {
        match self.store.children(paths::LIVE_NODES_ROOT).await {
            Ok(nodes) => {
                let mut projection = self.projection.write().unwrap();
                projection.live_nodes = nodes.into_iter().collect();
                drop(projection);
                self.changed.notify_waiters();
            }
            Err(CoordError::NoNode(_)) => {}
            Err(err) => {
                tracing::warn!(error = %err, "live nodes refresh failed");
            }
        }
        self.arm_live_nodes_watch().await;
    }

    async fn arm_live_nodes_watch(&self) {
        let weak = self.weak.clone();
        let callback: WatchCallback = Box::new(move |_event| {
            if let Some(reader) = Weak::upgrade(&weak) {
                let _ = reader.tx.send(FetchRequest::LiveNodes);
            }
        });
        if let Err(err) = self
            .store
            .watch_children(paths::LIVE_NODES_ROOT, callback)
            .await
        {
            tracing::debug!(error = %err, "live nodes watch registration failed");
        }
    }

    /// Re-register any fired (or never-armed) watches for a collection.
    async fn rearm_watches(&self, name: &str) {
        let to_arm: Vec<(String, bool, Arc<AtomicBool>)> = {
            let slots = self.watch_slots.lock().unwrap();
            let Some(slots) = slots.get(name) else {
                return;
            };
            slots
                .iter()
                .filter(|slot| !slot.armed.swap(true, Ordering::SeqCst))
                .map(|slot| (slot.path.clone(), slot.just_states, Arc::clone(&slot.armed)))
                .collect()
        };
        for (path, just_states, armed) in to_arm {
            let weak = self.weak.clone();
            let name = name.to_string();
            let armed_cb = Arc::clone(&armed);
            let callback: WatchCallback = Box::new(move |_event| {
                armed_cb.store(false, Ordering::SeqCst);
                if let Some(reader) = Weak::upgrade(&weak) {
                    let _ = reader.tx.send(FetchRequest::Collection {
                        name: name.clone(),
                        just_states,
                    });
                }
            });
            if let Err(err) = self.store.watch(&path, callback).await {
                // Arm again on the next pass.
                armed.store(false, Ordering::SeqCst);
                tracing::debug!(path = %path, error = %err, "watch registration failed");
            }
        }
    }
}
