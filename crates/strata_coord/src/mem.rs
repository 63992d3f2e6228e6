//! In-memory coordination store.
//!
//! Implements the full [`CoordStore`] contract against a process-local node
//! tree: versioned writes, ephemerals, sequential creates, fire-once
//! watches, and a session that can be expired on demand. Tests use the fault
//! hooks to exercise the `ConnectionLoss` and `SessionExpired` paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::store::{
    CoordError, CoordStore, CreateMode, SessionState, WatchCallback, WatchEvent, WatchKind,
};

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    version: i64,
    ephemeral: bool,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    seq_counters: HashMap<String, u64>,
    data_watches: HashMap<String, Vec<WatchCallback>>,
    child_watches: HashMap<String, Vec<WatchCallback>>,
    /// Number of upcoming calls that should fail with `ConnectionLoss`.
    inject_disconnects: u32,
}

/// Process-local [`CoordStore`] shared by every embedded node in a test
/// cluster.
pub struct MemCoordStore {
    state: Mutex<State>,
    session_tx: watch::Sender<SessionState>,
}

impl Default for MemCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordStore {
    pub fn new() -> Self {
        let (session_tx, _) = watch::channel(SessionState::Connected);
        Self {
            state: Mutex::new(State::default()),
            session_tx,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` calls fail with `ConnectionLoss`.
    pub fn inject_disconnects(&self, n: u32) {
        self.state.lock().unwrap().inject_disconnects = n;
    }

    /// Expire the session: every ephemeral vanishes, every watch is
    /// invalidated, and session subscribers observe `Expired`.
    pub fn expire_session(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let ephemerals: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral)
                .map(|(path, _)| path.clone())
                .collect();
            for path in ephemerals {
                state.nodes.remove(&path);
            }
            state.data_watches.clear();
            state.child_watches.clear();
        }
        let _ = self.session_tx.send(SessionState::Expired);
    }

    fn check_connected(&self, state: &mut State) -> Result<(), CoordError> {
        if *self.session_tx.borrow() == SessionState::Expired {
            return Err(CoordError::SessionExpired);
        }
        if state.inject_disconnects > 0 {
            state.inject_disconnects -= 1;
            return Err(CoordError::ConnectionLoss);
        }
        Ok(())
    }

    /// Take the fire-once watches that a write to `path` triggers, along
    /// with the child watches of its parent.
    fn take_watches(
        state: &mut State,
        path: &str,
        kind: WatchKind,
    ) -> Vec<(WatchCallback, WatchEvent)> {
        let mut fired = Vec::new();
        if let Some(callbacks) = state.data_watches.remove(path) {
            for cb in callbacks {
                fired.push((
                    cb,
                    WatchEvent {
                        path: path.to_string(),
                        kind,
                    },
                ));
            }
        }
        fired
    }

    fn take_child_watches(state: &mut State, parent: &str) -> Vec<(WatchCallback, WatchEvent)> {
        let mut fired = Vec::new();
        if let Some(callbacks) = state.child_watches.remove(parent) {
            for cb in callbacks {
                fired.push((
                    cb,
                    WatchEvent {
                        path: parent.to_string(),
                        kind: WatchKind::ChildrenChanged,
                    },
                ));
            }
        }
        fired
    }

    fn parent_of(path: &str) -> Option<&str> {
        let idx = path.rfind('/')?;
        if idx == 0 {
            Some("/")
        } else {
            Some(&path[..idx])
        }
    }

    fn ensure_parents(state: &mut State, path: &str) {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() <= 1 {
            return;
        }
        for segment in &segments[..segments.len() - 1] {
            prefix.push('/');
            prefix.push_str(segment);
            state.nodes.entry(prefix.clone()).or_insert(Node {
                data: Vec::new(),
                version: 0,
                ephemeral: false,
            });
        }
    }

    fn dispatch(fired: Vec<(WatchCallback, WatchEvent)>) {
        for (cb, event) in fired {
            cb(event);
        }
    }
}

#[async_trait]
impl CoordStore for MemCoordStore {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), CoordError> {
        let mut state = self.state.lock().unwrap();
        self.check_connected(&mut state)?;
        match state.nodes.get(path) {
            Some(node) => Ok((node.data.clone(), node.version)),
            None => Err(CoordError::NoNode(path.to_string())),
        }
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> Result<i64, CoordError> {
        let (fired, version) = {
            let mut state = self.state.lock().unwrap();
            self.check_connected(&mut state)?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(CoordError::VersionMismatch {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            let version = node.version;
            (
                Self::take_watches(&mut state, path, WatchKind::DataChanged),
                version,
            )
        };
        Self::dispatch(fired);
        Ok(version)
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        let (fired, actual_path) = {
            let mut state = self.state.lock().unwrap();
            self.check_connected(&mut state)?;

            let actual_path = match mode {
                CreateMode::EphemeralSequential => {
                    // The counter is per parent, so creation order across
                    // different names under one node stays total.
                    let parent = Self::parent_of(path).unwrap_or("/").to_string();
                    let counter = state.seq_counters.entry(parent).or_insert(0);
                    let seq = *counter;
                    *counter += 1;
                    format!("{path}{seq:010}")
                }
                _ => path.to_string(),
            };
            if state.nodes.contains_key(&actual_path) {
                return Err(CoordError::NodeExists(actual_path));
            }
            Self::ensure_parents(&mut state, &actual_path);
            state.nodes.insert(
                actual_path.clone(),
                Node {
                    data,
                    version: 0,
                    ephemeral: !matches!(mode, CreateMode::Persistent),
                },
            );
            let mut fired = Self::take_watches(&mut state, &actual_path, WatchKind::DataChanged);
            if let Some(parent) = Self::parent_of(&actual_path) {
                let parent = parent.to_string();
                fired.extend(Self::take_child_watches(&mut state, &parent));
            }
            (fired, actual_path)
        };
        Self::dispatch(fired);
        Ok(actual_path)
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        let fired = {
            let mut state = self.state.lock().unwrap();
            self.check_connected(&mut state)?;
            if state.nodes.remove(path).is_none() {
                return Err(CoordError::NoNode(path.to_string()));
            }
            let mut fired = Self::take_watches(&mut state, path, WatchKind::Deleted);
            if let Some(parent) = Self::parent_of(path) {
                let parent = parent.to_string();
                fired.extend(Self::take_child_watches(&mut state, &parent));
            }
            fired
        };
        Self::dispatch(fired);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<i64>, CoordError> {
        let mut state = self.state.lock().unwrap();
        self.check_connected(&mut state)?;
        Ok(state.nodes.get(path).map(|node| node.version))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        let mut state = self.state.lock().unwrap();
        self.check_connected(&mut state)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut names = Vec::new();
        for key in state.nodes.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.push(rest.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn watch(&self, path: &str, callback: WatchCallback) -> Result<(), CoordError> {
        let mut state = self.state.lock().unwrap();
        self.check_connected(&mut state)?;
        state
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    async fn watch_children(&self, path: &str, callback: WatchCallback) -> Result<(), CoordError> {
        let mut state = self.state.lock().unwrap();
        self.check_connected(&mut state)?;
        state
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    fn session(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn versioned_set_rejects_stale_writer() {
        let store = MemCoordStore::new();
        store
            .create("/a", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let v1 = store.set_data("/a", b"v1".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v1, 1);
        let err = store
            .set_data("/a", b"stale".to_vec(), Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::VersionMismatch { actual: 1, .. }));
        let (data, version) = store.get("/a").await.unwrap();
        assert_eq!(data, b"v1");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn sequential_creates_are_ordered() {
        let store = MemCoordStore::new();
        let first = store
            .create("/queue/r1-n_", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = store
            .create("/queue/r2-n_", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert!(first.ends_with("0000000000"));
        assert!(
            second.ends_with("0000000001"),
            "sequence is per parent, got {second}"
        );
        let mut children = store.children("/queue").await.unwrap();
        children.sort();
        assert_eq!(children.len(), 2);
    }

    #[tokio::test]
    async fn watch_fires_once_per_registration() {
        let store = MemCoordStore::new();
        store
            .create("/w", b"0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        static FIRED: AtomicU32 = AtomicU32::new(0);
        FIRED.store(0, Ordering::SeqCst);
        store
            .watch(
                "/w",
                Box::new(|_event| {
                    FIRED.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        store.set_data("/w", b"1".to_vec(), None).await.unwrap();
        store.set_data("/w", b"2".to_vec(), None).await.unwrap();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_expiry_drops_ephemerals() {
        let store = MemCoordStore::new();
        store
            .create("/live_nodes/n1", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        store
            .create("/keep", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let mut session = store.session();
        store.expire_session();
        assert_eq!(*session.borrow_and_update(), SessionState::Expired);
        let err = store.get("/live_nodes/n1").await.unwrap_err();
        assert!(matches!(err, CoordError::SessionExpired));
    }

    #[tokio::test]
    async fn injected_disconnects_are_transient() {
        let store = Arc::new(MemCoordStore::new());
        store
            .create("/t", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        store.inject_disconnects(2);
        let err = store.get("/t").await.unwrap_err();
        assert!(err.is_transient());
        let policy = crate::store::RetryPolicy {
            base: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let cloned = store.clone();
        let (data, _) = policy.run(|| cloned.get("/t")).await.unwrap();
        assert_eq!(data, b"x");
    }
}
